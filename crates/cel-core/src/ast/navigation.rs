//! A read-only navigable view over an AST.
//!
//! The view adds what the tree itself does not carry: parent links, depths,
//! and id-indexed lookup. It borrows the AST, is built on demand by a
//! transform, and is discarded afterwards, so the underlying tree stays
//! freely shareable.

use ahash::AHashMap;

use crate::ast::{Ast, Expr, ExprId, ExprKind};

#[derive(Debug)]
pub struct NavigableAst<'a> {
    ast: &'a Ast,
    nodes: AHashMap<ExprId, &'a Expr>,
    parents: AHashMap<ExprId, ExprId>,
    depths: AHashMap<ExprId, u32>,
    preorder: Vec<ExprId>,
    postorder: Vec<ExprId>,
}

impl<'a> NavigableAst<'a> {
    pub fn new(ast: &'a Ast) -> Self {
        let mut nav = Self {
            ast,
            nodes: AHashMap::new(),
            parents: AHashMap::new(),
            depths: AHashMap::new(),
            preorder: Vec::new(),
            postorder: Vec::new(),
        };
        nav.index(ast.root(), None, 0);
        nav
    }

    fn index(&mut self, expr: &'a Expr, parent: Option<ExprId>, depth: u32) {
        self.nodes.insert(expr.id, expr);
        if let Some(parent) = parent {
            self.parents.insert(expr.id, parent);
        }
        self.depths.insert(expr.id, depth);
        self.preorder.push(expr.id);
        for child in expr.children() {
            self.index(child, Some(expr.id), depth + 1);
        }
        self.postorder.push(expr.id);
    }

    pub fn ast(&self) -> &'a Ast {
        self.ast
    }

    pub fn node(&self, id: ExprId) -> Option<&'a Expr> {
        self.nodes.get(&id).copied()
    }

    pub fn parent(&self, id: ExprId) -> Option<&'a Expr> {
        self.parents.get(&id).and_then(|pid| self.node(*pid))
    }

    /// Distance from the root; the root has depth 0.
    pub fn depth(&self, id: ExprId) -> Option<u32> {
        self.depths.get(&id).copied()
    }

    /// Ancestors from the immediate parent up to the root.
    pub fn ancestors(&self, id: ExprId) -> Vec<&'a Expr> {
        let mut out = Vec::new();
        let mut current = id;
        while let Some(parent) = self.parents.get(&current) {
            if let Some(node) = self.node(*parent) {
                out.push(node);
            }
            current = *parent;
        }
        out
    }

    /// All nodes in pre-order (parents before children).
    pub fn preorder(&self) -> impl Iterator<Item = &'a Expr> + '_ {
        self.preorder.iter().filter_map(|id| self.node(*id))
    }

    /// All nodes in post-order (children before parents).
    pub fn postorder(&self) -> impl Iterator<Item = &'a Expr> + '_ {
        self.postorder.iter().filter_map(|id| self.node(*id))
    }

    /// Nodes matching a predicate, in pre-order.
    pub fn find(&self, mut predicate: impl FnMut(&Expr) -> bool) -> Vec<&'a Expr> {
        self.preorder().filter(|e| predicate(e)).collect()
    }

    /// The lowest common ancestor of a non-empty id set.
    pub fn lowest_common_ancestor(&self, ids: &[ExprId]) -> Option<ExprId> {
        let first = *ids.first()?;
        let mut chain: Vec<ExprId> = Vec::new();
        let mut current = Some(first);
        while let Some(id) = current {
            chain.push(id);
            current = self.parents.get(&id).copied();
        }
        for candidate in &chain {
            if ids.iter().all(|id| self.is_ancestor_or_self(*candidate, *id)) {
                return Some(*candidate);
            }
        }
        None
    }

    fn is_ancestor_or_self(&self, ancestor: ExprId, mut id: ExprId) -> bool {
        loop {
            if id == ancestor {
                return true;
            }
            match self.parents.get(&id) {
                Some(parent) => id = *parent,
                None => return false,
            }
        }
    }

    /// The comprehension nodes enclosing `id`, innermost first.
    pub fn enclosing_comprehensions(&self, id: ExprId) -> Vec<&'a Expr> {
        self.ancestors(id)
            .into_iter()
            .filter(|e| matches!(e.kind, ExprKind::Comprehension(_)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::factory::ExprFactory;
    use crate::ast::SourceInfo;

    fn sample() -> Ast {
        // 1 + size("ab")
        let mut fx = ExprFactory::new(1);
        let one = fx.int(1);
        let s = fx.string("ab");
        let size = fx.global_call("size", vec![s]);
        let add = fx.global_call(crate::operators::ADD, vec![one, size]);
        Ast::new(add, SourceInfo::default())
    }

    #[test]
    fn parents_and_depths() {
        let ast = sample();
        let nav = NavigableAst::new(&ast);
        let root = ast.root();
        assert_eq!(nav.depth(root.id), Some(0));
        for child in root.children() {
            assert_eq!(nav.parent(child.id).map(|p| p.id), Some(root.id));
            assert_eq!(nav.depth(child.id), Some(1));
        }
    }

    #[test]
    fn traversal_orders() {
        let ast = sample();
        let nav = NavigableAst::new(&ast);
        let pre: Vec<ExprId> = nav.preorder().map(|e| e.id).collect();
        let post: Vec<ExprId> = nav.postorder().map(|e| e.id).collect();
        assert_eq!(pre.len(), post.len());
        assert_eq!(pre.first(), Some(&ast.root().id));
        assert_eq!(post.last(), Some(&ast.root().id));
    }

    #[test]
    fn lowest_common_ancestor_of_leaves_is_root() {
        let ast = sample();
        let nav = NavigableAst::new(&ast);
        let leaves: Vec<ExprId> = nav
            .preorder()
            .filter(|e| e.children().is_empty())
            .map(|e| e.id)
            .collect();
        assert_eq!(nav.lowest_common_ancestor(&leaves), Some(ast.root().id));
    }
}
