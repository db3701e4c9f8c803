use serde::Serialize;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::models::SurfaceGeometryRow;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TreeError {
    #[error("Geometry tree has {0} roots, expected exactly one")]
    RootCount(usize),
    #[error("Geometry node {0} is referenced as parent but was never read")]
    MissingNode(i64),
    #[error("Geometry node {0} appears twice")]
    DuplicateNode(i64),
    #[error("Geometry nodes {0:?} are not reachable from the root")]
    Unreachable(Vec<i64>),
    #[error("Geometry node {0} has an undefined type")]
    Undefined(i64),
}

/// Semantic type of a geometry node, derived from its flags and children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GeometryType {
    Polygon,
    CompositeSurface,
    CompositeSolid,
    Solid,
    MultiSolid,
    MultiSurface,
    TriangulatedSurface,
    Undefined,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeometryNode {
    pub id: i64,
    pub gmlid: Option<String>,
    pub parent_id: Option<i64>,
    pub is_solid: bool,
    pub is_composite: bool,
    pub is_triangulated: bool,
    pub is_reverse: bool,
    pub is_xlink: i64,
    /// Encoded polygon payload; decoded only when the ring order has to change.
    pub geometry: Option<Vec<u8>>,
    pub cityobject_id: Option<i64>,
    children: Vec<i64>,
    pseudo: bool,
}

impl GeometryNode {
    fn pseudo(id: i64) -> Self {
        Self {
            id,
            pseudo: true,
            ..Default::default()
        }
    }

    pub fn children(&self) -> &[i64] {
        &self.children
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Arena of one `surface_geometry` tree keyed by row id.
#[derive(Debug, Clone)]
pub struct GeometryTree {
    root_id: i64,
    nodes: HashMap<i64, GeometryNode>,
}

impl GeometryTree {
    /// Build from rows in any order. A parent seen before its own row gets a
    /// placeholder that is filled in once the row arrives.
    pub fn build(rows: Vec<SurfaceGeometryRow>) -> Result<Self, TreeError> {
        let mut nodes: HashMap<i64, GeometryNode> = HashMap::with_capacity(rows.len());

        for row in rows {
            let parent_id = row.parent_id.filter(|p| *p != 0);
            {
                let node = nodes
                    .entry(row.id)
                    .or_insert_with(|| GeometryNode::pseudo(row.id));
                if !node.pseudo {
                    return Err(TreeError::DuplicateNode(row.id));
                }
                node.pseudo = false;
                node.gmlid = row.gmlid;
                node.parent_id = parent_id;
                node.is_solid = row.is_solid;
                node.is_composite = row.is_composite;
                node.is_triangulated = row.is_triangulated;
                node.is_reverse = row.is_reverse;
                node.is_xlink = row.is_xlink;
                node.geometry = row.geometry;
                node.cityobject_id = row.cityobject_id;
            }
            if let Some(parent_id) = parent_id {
                nodes
                    .entry(parent_id)
                    .or_insert_with(|| GeometryNode::pseudo(parent_id))
                    .children
                    .push(row.id);
            }
        }

        if let Some(missing) = nodes.values().find(|n| n.pseudo) {
            return Err(TreeError::MissingNode(missing.id));
        }

        let roots: Vec<i64> = nodes
            .values()
            .filter(|n| n.parent_id.is_none())
            .map(|n| n.id)
            .collect();
        if roots.len() != 1 {
            return Err(TreeError::RootCount(roots.len()));
        }

        for node in nodes.values_mut() {
            node.children.sort_unstable();
        }

        let tree = Self {
            root_id: roots[0],
            nodes,
        };

        let reachable: HashSet<i64> = tree.subtree_ids(tree.root_id).into_iter().collect();
        if reachable.len() != tree.nodes.len() {
            let mut unreachable: Vec<i64> = tree
                .nodes
                .keys()
                .filter(|id| !reachable.contains(id))
                .copied()
                .collect();
            unreachable.sort_unstable();
            return Err(TreeError::Unreachable(unreachable));
        }

        Ok(tree)
    }

    pub fn root_id(&self) -> i64 {
        self.root_id
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: i64) -> Option<&GeometryNode> {
        self.nodes.get(&id)
    }

    /// First node in pre-order carrying the given gml:id.
    pub fn find_by_gmlid(&self, gmlid: &str) -> Option<&GeometryNode> {
        self.subtree_ids(self.root_id)
            .into_iter()
            .filter_map(|id| self.nodes.get(&id))
            .find(|n| n.gmlid.as_deref() == Some(gmlid))
    }

    /// Ids of a subtree in pre-order: every parent precedes its children and
    /// siblings are visited in ascending id order.
    pub fn subtree_ids(&self, id: i64) -> Vec<i64> {
        let mut order = Vec::new();
        if !self.nodes.contains_key(&id) {
            return order;
        }

        let mut stack = vec![id];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            order.push(current);
            if let Some(node) = self.nodes.get(&current) {
                stack.extend(node.children.iter().rev());
            }
        }
        order
    }

    /// Type of a single node from its own flags and its children.
    pub fn node_type(&self, id: i64) -> GeometryType {
        let Some(node) = self.nodes.get(&id) else {
            return GeometryType::Undefined;
        };

        if node.geometry.is_some() {
            return if node.is_leaf() {
                GeometryType::Polygon
            } else {
                GeometryType::Undefined
            };
        }

        if node.is_triangulated {
            return if node.is_leaf() {
                GeometryType::Undefined
            } else {
                GeometryType::TriangulatedSurface
            };
        }

        match (node.is_solid, node.is_composite) {
            (false, true) => GeometryType::CompositeSurface,
            (true, true) => GeometryType::CompositeSolid,
            (true, false) => GeometryType::Solid,
            (false, false) if node.is_leaf() => GeometryType::Undefined,
            (false, false) => {
                let all_solid = node
                    .children
                    .iter()
                    .all(|c| self.nodes.get(c).is_some_and(|child| child.is_solid));
                if all_solid {
                    GeometryType::MultiSolid
                } else {
                    GeometryType::MultiSurface
                }
            }
        }
    }

    /// Classify a subtree top-down and return the type of its top node.
    /// Any undefined node makes the whole subtree unusable. A solid is only
    /// descended into when it wraps a single shell.
    pub fn classify_subtree(&self, id: i64) -> Result<GeometryType, TreeError> {
        if !self.nodes.contains_key(&id) {
            return Err(TreeError::MissingNode(id));
        }

        let mut stack = vec![id];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            let Some(node) = self.nodes.get(&current) else {
                return Err(TreeError::MissingNode(current));
            };
            match self.node_type(current) {
                GeometryType::Undefined => return Err(TreeError::Undefined(current)),
                GeometryType::Solid if node.children.len() != 1 => {}
                _ => stack.extend(node.children.iter().rev()),
            }
        }
        Ok(self.node_type(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::node;

    fn payload() -> Option<Vec<u8>> {
        Some(vec![1, 2, 3])
    }

    fn composite_surface_rows() -> Vec<SurfaceGeometryRow> {
        let mut root = node(1, Some("root"), None, 1);
        root.is_composite = true;
        let mut left = node(2, Some("left"), Some(1), 1);
        left.geometry = payload();
        let mut right = node(3, Some("right"), Some(1), 1);
        right.geometry = payload();
        // Children first to exercise placeholders
        vec![right, left, root]
    }

    #[test]
    fn test_build_out_of_order() {
        let tree = GeometryTree::build(composite_surface_rows()).unwrap();
        assert_eq!(tree.root_id(), 1);
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.get(1).unwrap().children(), &[2, 3]);
        assert_eq!(tree.subtree_ids(1), vec![1, 2, 3]);
        assert_eq!(tree.find_by_gmlid("right").unwrap().id, 3);
        assert!(tree.find_by_gmlid("nope").is_none());
    }

    #[test]
    fn test_parent_zero_is_root() {
        let rows = vec![node(5, Some("a"), Some(0), 5)];
        let tree = GeometryTree::build(rows).unwrap();
        assert_eq!(tree.root_id(), 5);
    }

    #[test]
    fn test_build_errors() {
        let rows = vec![node(2, None, Some(1), 1)];
        assert_eq!(GeometryTree::build(rows).unwrap_err(), TreeError::MissingNode(1));

        let rows = vec![node(1, None, None, 1), node(2, None, None, 2)];
        assert_eq!(GeometryTree::build(rows).unwrap_err(), TreeError::RootCount(2));

        let rows = vec![node(1, None, None, 1), node(1, None, None, 1)];
        assert_eq!(GeometryTree::build(rows).unwrap_err(), TreeError::DuplicateNode(1));

        let rows = vec![
            node(1, None, None, 1),
            node(2, None, Some(3), 1),
            node(3, None, Some(2), 1),
        ];
        assert_eq!(
            GeometryTree::build(rows).unwrap_err(),
            TreeError::Unreachable(vec![2, 3])
        );
    }

    fn single(flags: (bool, bool, bool), with_payload: bool, children: usize) -> GeometryTree {
        let (solid, composite, triangulated) = flags;
        let mut root = node(1, Some("n"), None, 1);
        root.is_solid = solid;
        root.is_composite = composite;
        root.is_triangulated = triangulated;
        if with_payload {
            root.geometry = payload();
        }
        let mut rows = vec![root];
        for i in 0..children {
            let mut child = node(10 + i as i64, None, Some(1), 1);
            child.geometry = payload();
            rows.push(child);
        }
        GeometryTree::build(rows).unwrap()
    }

    #[test]
    fn test_classification_table() {
        use GeometryType::*;
        // (solid, composite, triangulated), payload, children, expected
        let cases = [
            ((false, false, false), true, 0, Polygon),
            ((true, true, false), true, 0, Polygon),
            ((false, false, false), true, 1, Undefined),
            ((false, true, false), false, 2, CompositeSurface),
            ((true, true, false), false, 2, CompositeSolid),
            ((true, false, false), false, 1, Solid),
            ((true, false, false), false, 0, Solid),
            ((true, false, false), false, 2, Solid),
            ((false, false, false), false, 2, MultiSurface),
            ((false, false, false), false, 0, Undefined),
            ((false, false, true), false, 2, TriangulatedSurface),
            ((true, true, true), false, 1, TriangulatedSurface),
            ((false, false, true), false, 0, Undefined),
        ];
        for (flags, with_payload, children, expected) in cases {
            let tree = single(flags, with_payload, children);
            assert_eq!(
                tree.node_type(1),
                expected,
                "flags {:?} payload {} children {}",
                flags,
                with_payload,
                children
            );
        }
    }

    #[test]
    fn test_multi_solid_requires_all_children_solid() {
        let root = node(1, None, None, 1);
        let mut a = node(2, None, Some(1), 1);
        a.is_solid = true;
        let mut b = node(3, None, Some(1), 1);
        b.is_solid = true;
        let mut shell_a = node(4, None, Some(2), 1);
        shell_a.is_composite = true;
        let mut shell_b = node(5, None, Some(3), 1);
        shell_b.is_composite = true;
        let mut poly_a = node(6, None, Some(4), 1);
        poly_a.geometry = payload();
        let mut poly_b = node(7, None, Some(5), 1);
        poly_b.geometry = payload();

        let rows = vec![root, a, b, shell_a, shell_b, poly_a, poly_b];
        let tree = GeometryTree::build(rows.clone()).unwrap();
        assert_eq!(tree.classify_subtree(1).unwrap(), GeometryType::MultiSolid);
        assert_eq!(tree.classify_subtree(2).unwrap(), GeometryType::Solid);

        let mut mixed = rows;
        mixed[2].is_solid = false;
        mixed[2].is_composite = true;
        let tree = GeometryTree::build(mixed).unwrap();
        assert_eq!(tree.classify_subtree(1).unwrap(), GeometryType::MultiSurface);
    }

    #[test]
    fn test_undefined_anywhere_fails_subtree() {
        let mut root = node(1, None, None, 1);
        root.is_composite = true;
        let mut poly = node(2, None, Some(1), 1);
        poly.geometry = payload();
        let empty = node(3, None, Some(1), 1);
        let tree = GeometryTree::build(vec![root, poly, empty]).unwrap();

        assert_eq!(tree.classify_subtree(1), Err(TreeError::Undefined(3)));
        assert_eq!(tree.classify_subtree(2), Ok(GeometryType::Polygon));
        assert_eq!(tree.classify_subtree(42), Err(TreeError::MissingNode(42)));
    }

    #[test]
    fn test_solid_descends_only_into_single_shell() {
        let mut bare = node(1, None, None, 1);
        bare.is_solid = true;
        let tree = GeometryTree::build(vec![bare.clone()]).unwrap();
        assert_eq!(tree.classify_subtree(1), Ok(GeometryType::Solid));

        // Two shells, one of them empty: not visited
        let mut shell = node(2, None, Some(1), 1);
        shell.is_composite = true;
        let mut poly = node(4, None, Some(2), 1);
        poly.geometry = payload();
        let empty = node(3, None, Some(1), 1);
        let tree =
            GeometryTree::build(vec![bare.clone(), shell.clone(), empty, poly.clone()]).unwrap();
        assert_eq!(tree.classify_subtree(1), Ok(GeometryType::Solid));

        // A single shell is classified all the way down
        let broken = node(5, None, Some(2), 1);
        let tree = GeometryTree::build(vec![bare, shell, poly, broken]).unwrap();
        assert_eq!(tree.classify_subtree(1), Err(TreeError::Undefined(5)));
    }
}
