//! Model documents.
//!
//! A document is a JSON object whose top-level key is the model's default
//! name; the value holds a `format` version followed by the model's own
//! fields. Files and in-memory strings use the same text.

use serde_json::{Map, Value as Json};
use std::fs;
use tracing::debug;

use crate::error::{DispatchError, Result};
use crate::models::StatModel;

pub const FORMAT_VERSION: i64 = 3;

pub fn to_string<M: StatModel>(model: &M) -> Result<String> {
    let mut body = Map::new();
    body.insert("format".to_owned(), Json::from(FORMAT_VERSION));
    body.extend(model.write()?);

    let mut envelope = Map::new();
    envelope.insert(model.default_name().to_owned(), Json::Object(body));
    serde_json::to_string_pretty(&Json::Object(envelope))
        .map_err(|e| DispatchError::model(format!("failed to serialize model: {e}")))
}

pub fn save<M: StatModel>(model: &M, path: &str) -> Result<()> {
    let text = to_string(model)?;
    fs::write(path, text).map_err(|e| DispatchError::io(path, e))?;
    debug!(path, "Model saved");
    Ok(())
}

/// Reads the node called `obj_name`, or the first top-level node when the
/// name is empty.
pub fn from_str<M: StatModel>(text: &str, obj_name: &str) -> Result<M> {
    let doc: Json = serde_json::from_str(text)
        .map_err(|e| DispatchError::Deserialization(e.to_string()))?;
    let top = doc
        .as_object()
        .ok_or_else(|| DispatchError::Deserialization("document is not an object".to_owned()))?;
    let node = if obj_name.is_empty() {
        top.values().next()
    } else {
        top.get(obj_name)
    };
    let node = node.and_then(Json::as_object).ok_or_else(|| {
        DispatchError::Deserialization(format!("no model node named {obj_name:?}"))
    })?;

    match node.get("format").and_then(Json::as_i64) {
        Some(FORMAT_VERSION) => {}
        other => {
            return Err(DispatchError::Deserialization(format!(
                "unsupported format version {other:?}"
            )))
        }
    }
    M::read(node)
}

pub fn load<M: StatModel>(path: &str, obj_name: &str) -> Result<M> {
    let text = fs::read_to_string(path).map_err(|e| DispatchError::io(path, e))?;
    debug!(path, obj_name, "Loading model");
    from_str(&text, obj_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Boost, BoostParams, BoostType, ModelFactory};

    #[test]
    fn test_untrained_document_keeps_params() {
        let model = Boost::create(&BoostParams {
            boost_type: BoostType::Logit,
            max_depth: 3,
            ..BoostParams::default()
        });
        let text = to_string(&model).unwrap();
        assert!(text.contains("\"ml_boost\""));
        assert!(text.contains("\"format\": 3"));

        let back: Boost = from_str(&text, "").unwrap();
        assert_eq!(back, model);
        let named: Boost = from_str(&text, "ml_boost").unwrap();
        assert_eq!(named, model);
    }

    #[test]
    fn test_bad_documents() {
        let text = to_string(&Boost::default()).unwrap();
        assert!(matches!(
            from_str::<Boost>(&text, "other"),
            Err(DispatchError::Deserialization(_))
        ));
        assert!(matches!(
            from_str::<Boost>(r#"{"ml_boost": {"format": 2}}"#, ""),
            Err(DispatchError::Deserialization(_))
        ));
        assert!(matches!(
            from_str::<Boost>("not json", ""),
            Err(DispatchError::Deserialization(_))
        ));
        assert!(matches!(
            from_str::<Boost>(r#"{"ml_boost": {"format": 3, "training_params": {"max_depth": -1}}}"#, ""),
            Err(DispatchError::Deserialization(_))
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(
            load::<Boost>("/nonexistent/model.json", ""),
            Err(DispatchError::Io { .. })
        ));
    }
}
