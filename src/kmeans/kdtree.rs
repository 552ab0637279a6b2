//! k-d tree for nearest-center queries
//!
//! Built over the (few) cluster centers once per Lloyd iteration and queried
//! once per sample. Ties are resolved toward the lowest center index so the
//! result is identical to a brute-force scan.

use ndarray::{ArrayView1, ArrayView2};

struct Node {
    point: usize,
    axis: usize,
    left: Option<usize>,
    right: Option<usize>,
}

pub struct KdTree<'a> {
    points: ArrayView2<'a, f64>,
    nodes: Vec<Node>,
    root: Option<usize>,
}

#[inline]
fn squared_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// (distance, index) ordering used for tie-breaking
#[inline]
fn better(d: f64, i: usize, best_d: f64, best_i: usize) -> bool {
    d < best_d || (d == best_d && i < best_i)
}

impl<'a> KdTree<'a> {
    /// Build a tree over the rows of `points`
    pub fn build(points: ArrayView2<'a, f64>) -> Self {
        let mut tree = KdTree { points, nodes: Vec::with_capacity(points.nrows()), root: None };
        let mut indices: Vec<usize> = (0..points.nrows()).collect();
        tree.root = tree.build_node(&mut indices);
        tree
    }

    fn build_node(&mut self, indices: &mut [usize]) -> Option<usize> {
        if indices.is_empty() {
            return None;
        }

        // Split on the axis with the widest spread
        let dims = self.points.ncols();
        let mut axis = 0;
        let mut widest = f64::NEG_INFINITY;
        for d in 0..dims {
            let (lo, hi) = indices.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
                let v = self.points[[i, d]];
                (lo.min(v), hi.max(v))
            });
            if hi - lo > widest {
                widest = hi - lo;
                axis = d;
            }
        }

        let points = self.points;
        indices.sort_by(|&a, &b| {
            points[[a, axis]].total_cmp(&points[[b, axis]]).then(a.cmp(&b))
        });
        let mid = indices.len() / 2;
        let point = indices[mid];

        let node = self.nodes.len();
        self.nodes.push(Node { point, axis, left: None, right: None });

        let (left, rest) = indices.split_at_mut(mid);
        let left = self.build_node(left);
        let right = self.build_node(&mut rest[1..]);
        self.nodes[node].left = left;
        self.nodes[node].right = right;
        Some(node)
    }

    /// Index of and squared distance to the closest point
    pub fn nearest(&self, query: ArrayView1<f64>) -> Option<(usize, f64)> {
        let root = self.root?;
        let mut best = (usize::MAX, f64::INFINITY);
        self.search(root, query, &mut best);
        Some(best)
    }

    fn search(&self, node: usize, query: ArrayView1<f64>, best: &mut (usize, f64)) {
        let n = &self.nodes[node];
        let d = squared_distance(query, self.points.row(n.point));
        if better(d, n.point, best.1, best.0) {
            *best = (n.point, d);
        }

        let diff = query[n.axis] - self.points[[n.point, n.axis]];
        let (near, far) = if diff < 0.0 { (n.left, n.right) } else { (n.right, n.left) };
        if let Some(near) = near {
            self.search(near, query, best);
        }
        // Equal distances must still be visited for the index tie-break
        if let Some(far) = far {
            if diff * diff <= best.1 {
                self.search(far, query, best);
            }
        }
    }
}
