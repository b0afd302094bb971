//! Software scene graph
//!
//! A tree of positioned nodes. Children are kept in paint order (last child
//! is drawn on top), so hit-testing walks them in reverse.

use super::buffer::PixelBuffer;
use crate::engine::{NodeId, SceneHit, SurfaceId};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Grouping node without content
    Tree,
    /// Node drawing a surface's committed buffer
    Surface(SurfaceId),
    /// Solid rectangle, e.g. a software cursor plane
    Rect { width: u32, height: u32, argb: u32 },
}

#[derive(Debug)]
struct SceneNode {
    parent: Option<NodeId>,
    kind: NodeKind,
    x: i32,
    y: i32,
    children: Vec<NodeId>,
}

#[derive(Debug)]
pub struct SceneGraph {
    nodes: HashMap<NodeId, SceneNode>,
    root: NodeId,
    next_id: u32,
}

impl Default for SceneGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl SceneGraph {
    pub fn new() -> Self {
        let root = NodeId(0);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            SceneNode {
                parent: None,
                kind: NodeKind::Tree,
                x: 0,
                y: 0,
                children: Vec::new(),
            },
        );
        Self { nodes, root, next_id: 1 }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains_key(&node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self, node: NodeId) -> Option<NodeKind> {
        self.nodes.get(&node).map(|n| n.kind)
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(&node).and_then(|n| n.parent)
    }

    pub fn children(&self, node: NodeId) -> &[NodeId] {
        self.nodes.get(&node).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    fn insert(&mut self, parent: NodeId, kind: NodeKind) -> Option<NodeId> {
        if !self.nodes.contains_key(&parent) {
            return None;
        }
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            SceneNode {
                parent: Some(parent),
                kind,
                x: 0,
                y: 0,
                children: Vec::new(),
            },
        );
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.push(id);
        }
        Some(id)
    }

    pub fn create_tree(&mut self, parent: NodeId) -> Option<NodeId> {
        self.insert(parent, NodeKind::Tree)
    }

    pub fn create_surface(&mut self, parent: NodeId, surface: SurfaceId) -> Option<NodeId> {
        self.insert(parent, NodeKind::Surface(surface))
    }

    pub fn create_rect(&mut self, parent: NodeId, width: u32, height: u32, argb: u32) -> Option<NodeId> {
        self.insert(parent, NodeKind::Rect { width, height, argb })
    }

    pub fn set_position(&mut self, node: NodeId, x: i32, y: i32) {
        if let Some(n) = self.nodes.get_mut(&node) {
            n.x = x;
            n.y = y;
        }
    }

    /// Position relative to the parent
    pub fn position(&self, node: NodeId) -> Option<(i32, i32)> {
        self.nodes.get(&node).map(|n| (n.x, n.y))
    }

    /// Position in layout coordinates
    pub fn absolute_position(&self, node: NodeId) -> Option<(i32, i32)> {
        let mut current = self.nodes.get(&node)?;
        let (mut x, mut y) = (current.x, current.y);
        while let Some(parent) = current.parent {
            current = self.nodes.get(&parent)?;
            x += current.x;
            y += current.y;
        }
        Some((x, y))
    }

    /// Move the node above its siblings
    pub fn raise_to_top(&mut self, node: NodeId) {
        let Some(parent) = self.parent(node) else {
            return;
        };
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.retain(|c| *c != node);
            p.children.push(node);
        }
    }

    /// Destroy a node and its whole subtree
    pub fn destroy(&mut self, node: NodeId) {
        if node == self.root {
            return;
        }
        let Some(removed) = self.nodes.remove(&node) else {
            return;
        };
        if let Some(parent) = removed.parent.and_then(|p| self.nodes.get_mut(&p)) {
            parent.children.retain(|c| *c != node);
        }
        for child in removed.children {
            self.destroy(child);
        }
    }

    /// Destroy every surface node drawing `surface`
    pub fn destroy_surface_nodes(&mut self, surface: SurfaceId) {
        let doomed: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.kind == NodeKind::Surface(surface))
            .map(|(id, _)| *id)
            .collect();
        for node in doomed {
            self.destroy(node);
        }
    }

    /// Surfaces drawn by the graph, in paint order
    pub fn surfaces(&self) -> Vec<SurfaceId> {
        let mut out = Vec::new();
        self.walk_paint(self.root, &mut |kind, _, _| {
            if let NodeKind::Surface(s) = kind {
                out.push(s);
            }
        });
        out
    }

    fn walk_paint(&self, node: NodeId, visit: &mut dyn FnMut(NodeKind, i32, i32)) {
        self.walk_paint_at(node, 0, 0, visit);
    }

    fn walk_paint_at(&self, node: NodeId, ox: i32, oy: i32, visit: &mut dyn FnMut(NodeKind, i32, i32)) {
        let Some(n) = self.nodes.get(&node) else {
            return;
        };
        let (x, y) = (ox + n.x, oy + n.y);
        visit(n.kind, x, y);
        for child in &n.children {
            self.walk_paint_at(*child, x, y, visit);
        }
    }

    /// All nodes containing the point, front-most first
    pub fn nodes_at(
        &self,
        x: f64,
        y: f64,
        surface_size: &dyn Fn(SurfaceId) -> Option<(u32, u32)>,
    ) -> Vec<SceneHit> {
        let mut hits = Vec::new();
        for top in self.children(self.root).iter().rev() {
            self.collect_hits(*top, *top, 0, 0, x, y, surface_size, &mut hits);
        }
        hits
    }

    #[allow(clippy::too_many_arguments)]
    fn collect_hits(
        &self,
        node: NodeId,
        top: NodeId,
        ox: i32,
        oy: i32,
        x: f64,
        y: f64,
        surface_size: &dyn Fn(SurfaceId) -> Option<(u32, u32)>,
        hits: &mut Vec<SceneHit>,
    ) {
        let Some(n) = self.nodes.get(&node) else {
            return;
        };
        let (nx, ny) = (ox + n.x, oy + n.y);

        for child in n.children.iter().rev() {
            self.collect_hits(*child, top, nx, ny, x, y, surface_size, hits);
        }

        let (size, surface) = match n.kind {
            NodeKind::Tree => return,
            NodeKind::Surface(s) => match surface_size(s) {
                Some(size) => (size, Some(s)),
                None => return,
            },
            NodeKind::Rect { width, height, .. } => ((width, height), None),
        };
        let sx = x - nx as f64;
        let sy = y - ny as f64;
        if sx >= 0.0 && sy >= 0.0 && sx < size.0 as f64 && sy < size.1 as f64 {
            hits.push(SceneHit {
                node,
                tree: top,
                surface,
                sx,
                sy,
            });
        }
    }

    /// Composite the graph back-to-front into `dst`; returns whether any
    /// surface content was drawn
    pub fn render<'b>(
        &self,
        dst: &mut PixelBuffer,
        buffer_of: &dyn Fn(SurfaceId) -> Option<&'b PixelBuffer>,
    ) -> bool {
        let mut drew_surface = false;
        self.walk_paint(self.root, &mut |kind, x, y| match kind {
            NodeKind::Tree => {}
            NodeKind::Surface(s) => {
                if let Some(src) = buffer_of(s) {
                    dst.blit(src, x, y);
                    drew_surface = true;
                }
            }
            NodeKind::Rect { width, height, argb } => {
                let rect = PixelBuffer::solid(width, height, argb, dst.format());
                dst.blit(&rect, x, y);
            }
        });
        drew_surface
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PixelFormat;

    fn size_10(_: SurfaceId) -> Option<(u32, u32)> {
        Some((10, 10))
    }

    #[test]
    fn test_hit_front_most_first() {
        let mut scene = SceneGraph::new();
        let a = scene.create_tree(scene.root()).unwrap();
        let a_surf = scene.create_surface(a, SurfaceId(1)).unwrap();
        let b = scene.create_tree(scene.root()).unwrap();
        scene.create_surface(b, SurfaceId(2)).unwrap();
        scene.set_position(b, 5, 5);

        let hits = scene.nodes_at(7.0, 7.0, &size_10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].surface, Some(SurfaceId(2)));
        assert_eq!(hits[0].tree, b);
        assert_eq!((hits[0].sx, hits[0].sy), (2.0, 2.0));
        assert_eq!(hits[1].node, a_surf);

        scene.raise_to_top(a);
        let hits = scene.nodes_at(7.0, 7.0, &size_10);
        assert_eq!(hits[0].surface, Some(SurfaceId(1)));
    }

    #[test]
    fn test_destroy_subtree() {
        let mut scene = SceneGraph::new();
        let tree = scene.create_tree(scene.root()).unwrap();
        let child = scene.create_surface(tree, SurfaceId(1)).unwrap();
        assert_eq!(scene.len(), 2);

        scene.destroy(tree);
        assert!(!scene.contains(child));
        assert!(scene.is_empty());
        assert!(scene.children(scene.root()).is_empty());

        // Second destroy is a no-op
        scene.destroy(tree);
    }

    #[test]
    fn test_absolute_position() {
        let mut scene = SceneGraph::new();
        let tree = scene.create_tree(scene.root()).unwrap();
        let popup = scene.create_tree(tree).unwrap();
        scene.set_position(tree, 50, 50);
        scene.set_position(popup, 10, 20);
        assert_eq!(scene.absolute_position(popup), Some((60, 70)));
    }

    #[test]
    fn test_render_reports_content() {
        let mut scene = SceneGraph::new();
        let mut dst = PixelBuffer::new(20, 20, PixelFormat::Xrgb8888, 0);
        let src = PixelBuffer::solid(10, 10, 0xffff_0000, PixelFormat::Argb8888);

        assert!(!scene.render(&mut dst, &|_| None));

        let tree = scene.create_tree(scene.root()).unwrap();
        scene.create_surface(tree, SurfaceId(1)).unwrap();
        scene.set_position(tree, 5, 5);
        assert!(scene.render(&mut dst, &|_| Some(&src)));
        assert_eq!(dst.pixel(5, 5), Some(0xffff_0000));
        assert_eq!(dst.pixel(4, 4), Some(0));
    }
}
