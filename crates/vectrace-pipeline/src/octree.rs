//! Octree palette construction.
//!
//! Nodes live in an arena and refer to each other by index. Each level
//! splits all four RGBA channels at the node's midpoint, so a node has
//! up to 16 children. Leaves accumulate channel sums; reduction folds
//! sparsely populated leaves into their parents until the number of
//! surviving colors fits the requested palette size.

use crate::types::Color;

/// Deepest tree level.
const MAX_DEPTH: u8 = 8;

/// Live node budget; above it the deepest level is folded away.
const MAX_NODES: usize = 266_817;

type NodeId = usize;

#[derive(Debug, Clone)]
struct Node {
    parent: Option<NodeId>,
    children: [Option<NodeId>; 16],
    child_count: u8,
    /// Child slot within the parent.
    slot: u8,
    level: u8,
    mid: [i32; 4],
    /// Weighted pixel count used as the reduction key.
    pixel_count: u64,
    /// Pixels whose path ended at this node.
    unique_count: u64,
    totals: [u64; 4],
}

impl Node {
    const fn root() -> Self {
        Self {
            parent: None,
            children: [None; 16],
            child_count: 0,
            slot: 0,
            level: 0,
            mid: [128; 4],
            pixel_count: u64::MAX,
            unique_count: 0,
            totals: [0; 4],
        }
    }

    /// Child slot for `channels`: one bit per channel above the midpoint.
    fn slot_for(&self, channels: [u8; 4]) -> usize {
        channels
            .iter()
            .zip(&self.mid)
            .enumerate()
            .map(|(bit, (&c, &m))| usize::from(i32::from(c) > m) << bit)
            .sum()
    }
}

/// Arena-backed color octree.
#[derive(Debug, Clone)]
pub struct Octree {
    nodes: Vec<Node>,
    depth: u8,
    live: usize,
}

impl Octree {
    /// An empty tree sized for `max_colors`.
    ///
    /// The depth grows by one per factor of four in `max_colors` and is
    /// clamped to `2..=8`.
    #[must_use]
    pub fn new(max_colors: usize) -> Self {
        let mut depth: u8 = 1;
        let mut count = max_colors;
        while count != 0 {
            count /= 4;
            depth += 1;
        }
        if depth > 1 {
            depth -= 1;
        }
        Self {
            nodes: vec![Node::root()],
            depth: depth.clamp(2, MAX_DEPTH),
            live: 0,
        }
    }

    /// Current classification depth.
    #[must_use]
    pub const fn depth(&self) -> u8 {
        self.depth
    }

    fn add_child(&mut self, parent: NodeId, slot: usize, level: u8) -> NodeId {
        let bit = (1_i32 << (MAX_DEPTH - level)) >> 1;
        let pmid = self.nodes[parent].mid;
        let mut mid = [0; 4];
        for (c, m) in mid.iter_mut().enumerate() {
            *m = if slot & (1 << c) != 0 {
                pmid[c] + bit
            } else {
                pmid[c] - bit
            };
        }
        let id = self.nodes.len();
        #[allow(clippy::cast_possible_truncation)]
        let slot_byte = slot as u8;
        self.nodes.push(Node {
            parent: Some(parent),
            children: [None; 16],
            child_count: 0,
            slot: slot_byte,
            level,
            mid,
            pixel_count: 0,
            unique_count: 0,
            totals: [0; 4],
        });
        self.nodes[parent].children[slot] = Some(id);
        self.nodes[parent].child_count += 1;
        self.live += 1;
        id
    }

    /// Fold `id` into its parent: counts and sums move up, the link is cut.
    fn prune(&mut self, id: NodeId) {
        let Some(parent) = self.nodes[id].parent else {
            return;
        };
        let node = self.nodes[id].clone();
        let p = &mut self.nodes[parent];
        p.child_count -= 1;
        p.unique_count += node.unique_count;
        for (t, v) in p.totals.iter_mut().zip(node.totals) {
            *t += v;
        }
        p.children[usize::from(node.slot)] = None;
        self.nodes[id].parent = None;
        self.live -= 1;
    }

    fn children(&self, id: NodeId) -> Vec<NodeId> {
        let node = &self.nodes[id];
        if node.child_count == 0 {
            return Vec::new();
        }
        node.children.iter().flatten().copied().collect()
    }

    fn prune_level(&mut self, id: NodeId) {
        for child in self.children(id) {
            self.prune_level(child);
        }
        if self.nodes[id].level == self.depth {
            self.prune(id);
        }
    }

    /// Classify one pixel.
    pub fn insert(&mut self, color: Color) {
        if self.live > MAX_NODES {
            self.prune_level(0);
            self.depth -= 1;
            log::debug!("octree over budget, depth reduced to {}", self.depth);
        }
        let channels = color.channels();
        let mut node = 0;
        for level in 1..=self.depth {
            let slot = self.nodes[node].slot_for(channels);
            node = match self.nodes[node].children[slot] {
                Some(child) => child,
                None => self.add_child(node, slot, level),
            };
            let n = &mut self.nodes[node];
            n.pixel_count += 1 << (15 - u32::from(level));
        }
        let leaf = &mut self.nodes[node];
        leaf.unique_count += 1;
        for (t, &c) in leaf.totals.iter_mut().zip(&channels) {
            *t += u64::from(c);
        }
    }

    fn count_colors(&self, id: NodeId) -> usize {
        let own = usize::from(self.nodes[id].unique_count != 0);
        own + self
            .children(id)
            .into_iter()
            .map(|c| self.count_colors(c))
            .sum::<usize>()
    }

    /// Post-order reduction pass. Nodes at or below `threshold` fold into
    /// their parents; returns the smallest surviving pixel count.
    fn reduce(&mut self, id: NodeId, threshold: u64, mut next: u64, colors: &mut usize) -> u64 {
        for child in self.children(id) {
            next = self.reduce(child, threshold, next, colors);
        }
        let n = &self.nodes[id];
        if n.parent.is_some() && n.pixel_count <= threshold {
            self.prune(id);
        } else {
            if n.unique_count != 0 {
                *colors += 1;
            }
            next = next.min(n.pixel_count);
        }
        next
    }

    fn collect_colors(&self, id: NodeId, out: &mut Vec<Color>) {
        for child in self.children(id) {
            self.collect_colors(child, out);
        }
        let n = &self.nodes[id];
        let count = n.unique_count;
        if count != 0 {
            #[allow(clippy::cast_possible_truncation)]
            let [r, g, b, a] = n.totals.map(|t| ((t + count / 2) / count).min(255) as u8);
            out.push(Color::new(r, g, b, a));
        }
    }

    /// Reduce to at most `max_colors` entries and return the mean color
    /// of every surviving node, in post-order.
    #[must_use = "returns the palette"]
    pub fn into_palette(mut self, max_colors: usize) -> Vec<Color> {
        let mut colors = self.count_colors(0);
        let mut threshold = 1;
        while colors > max_colors.max(1) {
            colors = 0;
            threshold = self.reduce(0, threshold, u64::MAX, &mut colors);
        }
        let mut out = Vec::with_capacity(colors);
        self.collect_colors(0, &mut out);
        out
    }
}

/// Build a palette of at most `max_colors` entries from `pixels`.
#[must_use = "returns the palette"]
pub fn build_palette(pixels: impl IntoIterator<Item = Color>, max_colors: usize) -> Vec<Color> {
    let mut tree = Octree::new(max_colors);
    for c in pixels {
        tree.insert(c);
    }
    tree.into_palette(max_colors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_follows_palette_size() {
        assert_eq!(Octree::new(1).depth(), 2);
        assert_eq!(Octree::new(8).depth(), 2);
        assert_eq!(Octree::new(16).depth(), 3);
        assert_eq!(Octree::new(64).depth(), 4);
        assert_eq!(Octree::new(256).depth(), 5);
        assert_eq!(Octree::new(usize::MAX).depth(), 8);
    }

    #[test]
    fn empty_input_gives_empty_palette() {
        assert!(build_palette(Vec::new(), 8).is_empty());
    }

    #[test]
    fn two_distinct_colors_survive() {
        let red = Color::rgb(250, 10, 10);
        let blue = Color::rgb(10, 10, 250);
        let pixels = std::iter::repeat_n(red, 50).chain(std::iter::repeat_n(blue, 30));
        let palette = build_palette(pixels, 8);
        assert_eq!(palette.len(), 2);
        assert!(palette.contains(&red));
        assert!(palette.contains(&blue));
    }

    #[test]
    fn palette_never_exceeds_budget() {
        let pixels: Vec<Color> = (0..4096_u32)
            .map(|i| {
                #[allow(clippy::cast_possible_truncation)]
                let c = Color::rgb((i * 7) as u8, (i * 13) as u8, (i * 29) as u8);
                c
            })
            .collect();
        for max in [1, 2, 4, 8, 16, 32] {
            let palette = build_palette(pixels.iter().copied(), max);
            assert!(!palette.is_empty());
            assert!(palette.len() <= max, "{} > {max}", palette.len());
        }
    }

    #[test]
    fn single_color_budget_averages_everything() {
        let pixels = [Color::rgb(0, 0, 0), Color::rgb(255, 255, 255)];
        let palette = build_palette(pixels, 1);
        assert_eq!(palette.len(), 1);
        // (255 + 1) / 2, rounded half up.
        assert_eq!(palette[0], Color::rgb(128, 128, 128));
    }

    #[test]
    fn alpha_splits_the_tree() {
        let solid = Color::new(100, 100, 100, 255);
        let faint = Color::new(100, 100, 100, 60);
        let pixels = std::iter::repeat_n(solid, 10).chain(std::iter::repeat_n(faint, 10));
        let palette = build_palette(pixels, 8);
        assert!(palette.contains(&solid));
        assert!(palette.contains(&faint));
    }
}
