//! Flat decision-tree storage shared by every weak learner of an ensemble,
//! and the weighted CART grower that fills it.
//!
//! All trees live in one `Forest`: nodes, splits and categorical subsets are
//! addressed by index, `roots` holds the first node of each tree. Index
//! fields use -1 for "none".

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

/// Smallest weight / probability treated as non-zero.
pub(crate) const EPS: f64 = f32::EPSILON as f64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub value: f64,
    pub class_idx: i32,
    pub parent: i32,
    pub left: i32,
    pub right: i32,
    /// Direction (-1 left, +1 right) for samples that no split can route.
    pub default_dir: i32,
    /// Primary split, followed by its surrogates through `Split::next`.
    pub split: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Split {
    pub var_idx: i32,
    pub inversed: bool,
    pub quality: f32,
    pub next: i32,
    /// Threshold of an ordered split (`x <= c` goes left).
    pub c: f32,
    /// Start of the category bitmask in `Forest::subsets`, -1 for ordered splits.
    pub subset_ofs: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Forest {
    pub nodes: Vec<Node>,
    pub splits: Vec<Split>,
    pub subsets: Vec<i32>,
    pub roots: Vec<i32>,
}

impl Forest {
    fn direction(&self, split: &Split, v: f32) -> i32 {
        let dir = if split.subset_ofs >= 0 {
            let cat = v as usize;
            let word = self
                .subsets
                .get(split.subset_ofs as usize + cat / 32)
                .copied()
                .unwrap_or(0) as u32;
            if word & (1u32 << (cat % 32)) != 0 {
                -1
            } else {
                1
            }
        } else if v <= split.c {
            -1
        } else {
            1
        };
        if split.inversed {
            -dir
        } else {
            dir
        }
    }

    /// Routes a sample through `node`'s split chain. `value_of` returns the
    /// encoded value of a variable, NaN when missing.
    pub fn route(&self, node: &Node, value_of: impl Fn(usize) -> f32) -> i32 {
        let mut s = node.split;
        while s >= 0 {
            let split = &self.splits[s as usize];
            let v = value_of(split.var_idx as usize);
            if !v.is_nan() {
                return self.direction(split, v);
            }
            s = split.next;
        }
        node.default_dir
    }

    /// Leaf reached from `root`.
    pub fn leaf(&self, root: i32, value_of: impl Fn(usize) -> f32 + Copy) -> &Node {
        let mut node = &self.nodes[root as usize];
        while node.split >= 0 {
            let next = if self.route(node, value_of) < 0 {
                node.left
            } else {
                node.right
            };
            node = &self.nodes[next as usize];
        }
        node
    }

    /// Structural checks for a forest read from an untrusted document.
    pub fn validate(&self, var_all: usize) -> Result<(), String> {
        let n_nodes = self.nodes.len() as i32;
        let n_splits = self.splits.len() as i32;
        for &root in &self.roots {
            if root < 0 || root >= n_nodes {
                return Err(format!("root {root} out of range"));
            }
        }
        for (i, node) in self.nodes.iter().enumerate() {
            let i = i as i32;
            if node.split >= n_splits {
                return Err(format!("node {i}: split {} out of range", node.split));
            }
            if node.split >= 0 {
                // Children are always stored after their parent, which also rules out cycles.
                for child in [node.left, node.right] {
                    if child <= i || child >= n_nodes {
                        return Err(format!("node {i}: child {child} out of range"));
                    }
                }
            }
        }
        for (i, split) in self.splits.iter().enumerate() {
            if split.var_idx < 0 || split.var_idx as usize >= var_all {
                return Err(format!("split {i}: variable {} out of range", split.var_idx));
            }
            if split.next >= n_splits || (split.next >= 0 && split.next <= i as i32) {
                return Err(format!("split {i}: next {} out of range", split.next));
            }
            if split.subset_ofs >= self.subsets.len() as i32 {
                return Err(format!("split {i}: subset offset {} out of range", split.subset_ofs));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeafRule {
    /// +1 / -1 by weighted majority.
    Sign,
    /// Half log-odds of the positive class.
    HalfLogOdds,
    /// Weighted mean of the targets.
    Mean,
}

impl LeafRule {
    fn is_classification(self) -> bool {
        !matches!(self, Self::Mean)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TreeParams {
    pub max_depth: usize,
    pub min_sample_count: usize,
    pub regression_accuracy: f64,
    pub use_surrogates: bool,
}

/// Training matrix and per-sample targets for one tree.
pub(crate) struct Problem<'a> {
    /// Encoded samples, one row per training position; categorical columns
    /// hold category indices.
    pub x: ArrayView2<'a, f32>,
    pub vars: &'a [usize],
    /// Category count per column, 0 for ordered variables.
    pub n_cats: &'a [usize],
    /// +-1 for classification trees.
    pub targets: &'a [f64],
    pub weights: &'a [f64],
}

/// Weighted sums over a set of samples. For classification `s` is the
/// positive-class weight; for regression it is the weighted target sum.
#[derive(Debug, Clone, Copy, Default)]
struct Stats {
    w: f64,
    s: f64,
    q: f64,
}

impl Stats {
    fn add(&mut self, w: f64, t: f64, classification: bool) {
        self.w += w;
        if classification {
            if t > 0.0 {
                self.s += w;
            }
        } else {
            self.s += w * t;
            self.q += w * t * t;
        }
    }

    fn minus(self, other: Stats) -> Stats {
        Stats {
            w: self.w - other.w,
            s: self.s - other.s,
            q: self.q - other.q,
        }
    }

    /// Split score; higher is purer. Gini for classification, SSE reduction
    /// for regression.
    fn score(self, classification: bool) -> f64 {
        if self.w <= EPS {
            0.0
        } else if classification {
            (self.s * self.s + (self.w - self.s) * (self.w - self.s)) / self.w
        } else {
            self.s * self.s / self.w
        }
    }
}

enum Candidate {
    Ordered { var: usize, c: f32 },
    Categorical { var: usize, left: Vec<usize> },
}

pub(crate) struct TreeBuilder<'a> {
    problem: Problem<'a>,
    params: &'a TreeParams,
    leaf: LeafRule,
    forest: &'a mut Forest,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(
        problem: Problem<'a>,
        params: &'a TreeParams,
        leaf: LeafRule,
        forest: &'a mut Forest,
    ) -> Self {
        Self {
            problem,
            params,
            leaf,
            forest,
        }
    }

    /// Grows one tree over `samples` (row positions) and registers its root.
    pub fn grow(mut self, samples: Vec<usize>) -> i32 {
        let root = self.grow_node(samples, -1, 0);
        self.forest.roots.push(root);
        root
    }

    fn classification(&self) -> bool {
        self.leaf.is_classification()
    }

    fn stats(&self, samples: &[usize]) -> Stats {
        let mut st = Stats::default();
        for &i in samples {
            st.add(self.problem.weights[i], self.problem.targets[i], self.classification());
        }
        st
    }

    fn leaf_value(&self, st: Stats) -> f64 {
        if st.w <= EPS {
            return 0.0;
        }
        match self.leaf {
            LeafRule::Sign => {
                if st.s * 2.0 >= st.w {
                    1.0
                } else {
                    -1.0
                }
            }
            LeafRule::HalfLogOdds => {
                let p = (st.s / st.w).clamp(EPS, 1.0 - EPS);
                0.5 * (p / (1.0 - p)).ln()
            }
            LeafRule::Mean => st.s / st.w,
        }
    }

    fn is_terminal(&self, samples: &[usize], st: Stats, depth: usize) -> bool {
        if depth >= self.params.max_depth
            || samples.len() < self.params.min_sample_count.max(2)
            || st.w <= EPS
        {
            return true;
        }
        if self.classification() {
            st.s <= EPS || st.w - st.s <= EPS
        } else {
            let mean = st.s / st.w;
            let var = (st.q / st.w - mean * mean).max(0.0);
            var.sqrt() <= self.params.regression_accuracy
        }
    }

    fn grow_node(&mut self, samples: Vec<usize>, parent: i32, depth: usize) -> i32 {
        let st = self.stats(&samples);
        let value = self.leaf_value(st);
        let idx = self.forest.nodes.len() as i32;
        self.forest.nodes.push(Node {
            value,
            class_idx: i32::from(value > 0.0),
            parent,
            left: -1,
            right: -1,
            default_dir: -1,
            split: -1,
        });
        if self.is_terminal(&samples, st, depth) {
            return idx;
        }
        let Some((candidate, quality)) = self.best_split(&samples) else {
            return idx;
        };

        let split_idx = self.push_split(&candidate, quality);
        let primary = self.forest.splits[split_idx as usize].clone();
        let x = self.problem.x;

        // Directions of the samples the primary split can see.
        let known: Vec<(usize, i32)> = samples
            .iter()
            .filter_map(|&i| {
                let v = x[[i, primary.var_idx as usize]];
                (!v.is_nan()).then(|| (i, self.forest.direction(&primary, v)))
            })
            .collect();
        let (w_left, w_right) = known.iter().fold((0.0, 0.0), |(l, r), &(i, d)| {
            let w = self.problem.weights[i];
            if d < 0 {
                (l + w, r)
            } else {
                (l, r + w)
            }
        });
        let default_dir = if w_left >= w_right { -1 } else { 1 };
        if self.params.use_surrogates {
            self.attach_surrogates(split_idx, &known);
        }

        {
            let node = &mut self.forest.nodes[idx as usize];
            node.split = split_idx;
            node.default_dir = default_dir;
        }
        let node = self.forest.nodes[idx as usize].clone();
        let (left, right): (Vec<usize>, Vec<usize>) = samples
            .into_iter()
            .partition(|&i| self.forest.route(&node, |v| x[[i, v]]) < 0);

        let l = self.grow_node(left, idx, depth + 1);
        let r = self.grow_node(right, idx, depth + 1);
        let node = &mut self.forest.nodes[idx as usize];
        node.left = l;
        node.right = r;
        idx
    }

    fn best_split(&self, samples: &[usize]) -> Option<(Candidate, f64)> {
        let mut best: Option<(Candidate, f64)> = None;
        for &var in self.problem.vars {
            let found = match self.problem.n_cats[var] {
                0 => self.best_ordered(samples, var),
                k => self.best_categorical(samples, var, k),
            };
            if let Some((cand, gain)) = found {
                if gain > 1e-12 && best.as_ref().map_or(true, |(_, g)| gain > *g) {
                    best = Some((cand, gain));
                }
            }
        }
        best
    }

    fn best_ordered(&self, samples: &[usize], var: usize) -> Option<(Candidate, f64)> {
        let cls = self.classification();
        let x = self.problem.x;
        let mut known: Vec<(f32, usize)> = samples
            .iter()
            .map(|&i| (x[[i, var]], i))
            .filter(|(v, _)| !v.is_nan())
            .collect();
        if known.len() < 2 {
            return None;
        }
        known.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut total = Stats::default();
        for &(_, i) in &known {
            total.add(self.problem.weights[i], self.problem.targets[i], cls);
        }
        let base = total.score(cls);
        let mut left = Stats::default();
        let mut best: Option<(f32, f64)> = None;
        for k in 0..known.len() - 1 {
            let (v, i) = known[k];
            left.add(self.problem.weights[i], self.problem.targets[i], cls);
            let next = known[k + 1].0;
            if v == next {
                continue;
            }
            let right = total.minus(left);
            if left.w <= EPS || right.w <= EPS {
                continue;
            }
            let gain = left.score(cls) + right.score(cls) - base;
            if best.map_or(true, |(_, g)| gain > g) {
                let mid = (v + next) * 0.5;
                best = Some((if mid < next { mid } else { v }, gain));
            }
        }
        best.map(|(c, gain)| (Candidate::Ordered { var, c }, gain))
    }

    /// Orders categories by their mean response and sweeps prefixes, which
    /// finds the best binary partition for two-class and regression targets.
    fn best_categorical(&self, samples: &[usize], var: usize, n_cats: usize) -> Option<(Candidate, f64)> {
        let cls = self.classification();
        let x = self.problem.x;
        let mut per_cat = vec![Stats::default(); n_cats];
        for &i in samples {
            let v = x[[i, var]];
            if v.is_nan() || v as usize >= n_cats {
                continue;
            }
            per_cat[v as usize].add(self.problem.weights[i], self.problem.targets[i], cls);
        }
        let mut present: Vec<usize> = (0..n_cats).filter(|&c| per_cat[c].w > EPS).collect();
        if present.len() < 2 {
            return None;
        }
        present.sort_by(|&a, &b| {
            let ra = per_cat[a].s / per_cat[a].w;
            let rb = per_cat[b].s / per_cat[b].w;
            ra.total_cmp(&rb)
        });

        let total = present.iter().fold(Stats::default(), |acc, &c| Stats {
            w: acc.w + per_cat[c].w,
            s: acc.s + per_cat[c].s,
            q: acc.q + per_cat[c].q,
        });
        let base = total.score(cls);
        let mut left = Stats::default();
        let mut best: Option<(usize, f64)> = None;
        for (k, &c) in present[..present.len() - 1].iter().enumerate() {
            left = Stats {
                w: left.w + per_cat[c].w,
                s: left.s + per_cat[c].s,
                q: left.q + per_cat[c].q,
            };
            let gain = left.score(cls) + total.minus(left).score(cls) - base;
            if best.map_or(true, |(_, g)| gain > g) {
                best = Some((k + 1, gain));
            }
        }
        best.map(|(n_left, gain)| {
            (
                Candidate::Categorical {
                    var,
                    left: present[..n_left].to_vec(),
                },
                gain,
            )
        })
    }

    fn push_split(&mut self, candidate: &Candidate, quality: f64) -> i32 {
        let split = match candidate {
            Candidate::Ordered { var, c } => Split {
                var_idx: *var as i32,
                inversed: false,
                quality: quality as f32,
                next: -1,
                c: *c,
                subset_ofs: -1,
            },
            Candidate::Categorical { var, left } => {
                let words = self.problem.n_cats[*var].div_ceil(32);
                let ofs = self.forest.subsets.len();
                self.forest.subsets.resize(ofs + words, 0);
                for &cat in left {
                    let word = &mut self.forest.subsets[ofs + cat / 32];
                    *word = (*word as u32 | (1u32 << (cat % 32))) as i32;
                }
                Split {
                    var_idx: *var as i32,
                    inversed: false,
                    quality: quality as f32,
                    next: -1,
                    c: 0.0,
                    subset_ofs: ofs as i32,
                }
            }
        };
        self.forest.splits.push(split);
        (self.forest.splits.len() - 1) as i32
    }

    /// Chains ordered-variable surrogates that agree with the primary split
    /// better than the default direction does, best first.
    fn attach_surrogates(&mut self, primary: i32, known: &[(usize, i32)]) {
        let primary_var = self.forest.splits[primary as usize].var_idx as usize;
        let x = self.problem.x;
        let mut found: Vec<Split> = Vec::new();
        for &var in self.problem.vars {
            if var == primary_var || self.problem.n_cats[var] != 0 {
                continue;
            }
            let mut pairs: Vec<(f32, i32, f64)> = known
                .iter()
                .map(|&(i, d)| (x[[i, var]], d, self.problem.weights[i]))
                .filter(|(v, _, _)| !v.is_nan())
                .collect();
            if pairs.len() < 2 {
                continue;
            }
            pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
            let total_left: f64 = pairs.iter().filter(|p| p.1 < 0).map(|p| p.2).sum();
            let total_right: f64 = pairs.iter().filter(|p| p.1 > 0).map(|p| p.2).sum();

            let (mut ll, mut lr) = (0.0, 0.0);
            let mut best: Option<(f32, bool, f64)> = None;
            for k in 0..pairs.len() - 1 {
                let (v, d, w) = pairs[k];
                if d < 0 {
                    ll += w;
                } else {
                    lr += w;
                }
                let next = pairs[k + 1].0;
                if v == next {
                    continue;
                }
                let agree = ll + (total_right - lr);
                let agree_inv = lr + (total_left - ll);
                let (inversed, score) = if agree_inv > agree {
                    (true, agree_inv)
                } else {
                    (false, agree)
                };
                if best.map_or(true, |(_, _, s)| score > s) {
                    let mid = (v + next) * 0.5;
                    best = Some((if mid < next { mid } else { v }, inversed, score));
                }
            }
            if let Some((c, inversed, score)) = best {
                if score > total_left.max(total_right) + EPS {
                    found.push(Split {
                        var_idx: var as i32,
                        inversed,
                        quality: score as f32,
                        next: -1,
                        c,
                        subset_ofs: -1,
                    });
                }
            }
        }
        found.sort_by(|a, b| b.quality.total_cmp(&a.quality));

        let mut prev = primary;
        for mut split in found {
            split.next = -1;
            self.forest.splits.push(split);
            let idx = (self.forest.splits.len() - 1) as i32;
            self.forest.splits[prev as usize].next = idx;
            prev = idx;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn params(max_depth: usize) -> TreeParams {
        TreeParams {
            max_depth,
            min_sample_count: 2,
            regression_accuracy: 0.0,
            use_surrogates: false,
        }
    }

    #[test]
    fn test_stump_on_ordered_variable() {
        let x = Array2::from_shape_fn((8, 1), |(i, _)| i as f32);
        let targets: Vec<f64> = (0..8).map(|i| if i < 4 { -1.0 } else { 1.0 }).collect();
        let weights = vec![1.0; 8];
        let mut forest = Forest::default();
        let p = params(1);
        let root = TreeBuilder::new(
            Problem {
                x: x.view(),
                vars: &[0],
                n_cats: &[0],
                targets: &targets,
                weights: &weights,
            },
            &p,
            LeafRule::Sign,
            &mut forest,
        )
        .grow((0..8).collect());

        assert_eq!(forest.roots, vec![root]);
        assert_eq!(forest.nodes.len(), 3);
        assert_eq!(forest.splits[0].c, 3.5);
        assert_eq!(forest.leaf(root, |_| 1.0).value, -1.0);
        assert_eq!(forest.leaf(root, |_| 6.0).value, 1.0);
        assert!(forest.validate(1).is_ok());
    }

    #[test]
    fn test_categorical_subset_split() {
        // categories 0 and 2 are negative, 1 is positive
        let cats = [0.0f32, 1.0, 2.0, 0.0, 1.0, 2.0];
        let x = Array2::from_shape_fn((6, 1), |(i, _)| cats[i]);
        let targets: Vec<f64> = cats.iter().map(|&c| if c == 1.0 { 1.0 } else { -1.0 }).collect();
        let weights = vec![1.0; 6];
        let mut forest = Forest::default();
        let p = params(1);
        let root = TreeBuilder::new(
            Problem {
                x: x.view(),
                vars: &[0],
                n_cats: &[3],
                targets: &targets,
                weights: &weights,
            },
            &p,
            LeafRule::Mean,
            &mut forest,
        )
        .grow((0..6).collect());

        assert_eq!(forest.subsets.len(), 1);
        assert_eq!(forest.splits[0].subset_ofs, 0);
        assert_eq!(forest.leaf(root, |_| 1.0).value, 1.0);
        assert_eq!(forest.leaf(root, |_| 0.0).value, -1.0);
        assert_eq!(forest.leaf(root, |_| 2.0).value, -1.0);
    }

    #[test]
    fn test_surrogate_routes_missing_values() {
        let x = Array2::from_shape_fn((10, 2), |(i, j)| if j == 0 { i as f32 } else { 100.0 - i as f32 });
        let targets: Vec<f64> = (0..10).map(|i| if i < 5 { -1.0 } else { 1.0 }).collect();
        let weights = vec![1.0; 10];
        let mut forest = Forest::default();
        let p = TreeParams {
            use_surrogates: true,
            ..params(1)
        };
        let root = TreeBuilder::new(
            Problem {
                x: x.view(),
                vars: &[0, 1],
                n_cats: &[0, 0],
                targets: &targets,
                weights: &weights,
            },
            &p,
            LeafRule::Sign,
            &mut forest,
        )
        .grow((0..10).collect());

        let primary = &forest.splits[forest.nodes[root as usize].split as usize];
        assert!(primary.next >= 0);
        let surrogate = &forest.splits[primary.next as usize];
        assert!(surrogate.inversed);

        // variable 0 missing, variable 1 = 92 corresponds to i = 8 (positive)
        let row = [f32::NAN, 92.0];
        assert_eq!(forest.leaf(root, |v| row[v]).value, 1.0);
        let row = [f32::NAN, 99.0];
        assert_eq!(forest.leaf(root, |v| row[v]).value, -1.0);
    }

    #[test]
    fn test_validate_rejects_dangling_child() {
        let forest = Forest {
            nodes: vec![Node {
                value: 0.0,
                class_idx: 0,
                parent: -1,
                left: 5,
                right: 6,
                default_dir: -1,
                split: 0,
            }],
            splits: vec![Split {
                var_idx: 0,
                inversed: false,
                quality: 1.0,
                next: -1,
                c: 0.5,
                subset_ofs: -1,
            }],
            subsets: vec![],
            roots: vec![0],
        };
        assert!(forest.validate(1).is_err());
    }
}
