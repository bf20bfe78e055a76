// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

//! Region classification.
//!
//! Regions are built bottom-up over the dominator tree. Each node is emitted as its
//! own code (`Leaf` plus the conditional, switch or terminal ending it), with the
//! nodes it immediately dominates placed either inline at the branch that reaches
//! them, as case or catch bodies, or after the node wrapped in a breakable block.
//!
//! Loops and protected regions form scopes. A node that leaves a scope is placed
//! after the scope by the scope's entry, so a loop's follow code never ends up inside
//! the loop body. Scopes must nest; overlapping loops and protected regions are
//! rejected.

use super::dominance::{find_natural_loops, DominatorTree, NaturalLoop};
use super::flow::{FlowExit, FlowGraph};
use super::region::{
    CaseLabel, CatchArm, Condition, LoopKind, LoopRegion, Region, SwitchArm, SwitchRegion,
    TryRegion, MAX_NESTING_DEPTH,
};
use crate::assembly::statement::Statement;
use crate::bytecode::{BlockId, CaseDecoding, SwitchTable};
use crate::error::{Diagnostic, ReconstructionError, Result};
use crate::expression::builder::{BuiltMethod, ExitExpression};
use crate::expression::enum_switch::{enum_switch_table, EnumSwitchTable, TableKind};
use crate::expression::node::ExpressionKind;
use crate::expression::short_circuit::Junction;
use crate::graph::{BasicBlockGraph, ControlFlow};
use crate::options::ReconstructionOptions;
use crate::types::{SemanticType, TypeLookup};
use itertools::Itertools;
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Everything classification reads.
pub struct ClassifierContext<'a> {
    pub flow: &'a FlowGraph,
    pub graph: &'a BasicBlockGraph,
    pub built: &'a BuiltMethod,
    pub types: &'a dyn TypeLookup,
    pub options: &'a ReconstructionOptions,
}

#[derive(Debug)]
pub struct Classification {
    pub region: Region,
    pub diagnostics: Vec<Diagnostic>,
    /// First scope id not used by the region tree.
    pub next_scope: usize,
}

#[derive(Debug, Clone)]
enum ScopeKind {
    Loop(NaturalLoop),
    /// Handlers in exception table order, with their catch types.
    Try(Vec<(BlockId, Option<String>)>),
}

/// Covered nodes with the handlers protecting exactly those nodes.
type ProtectedRegion = (BTreeSet<BlockId>, Vec<(BlockId, Option<String>)>);

#[derive(Debug, Clone)]
struct Scope {
    kind: ScopeKind,
    entry: BlockId,
    members: BTreeSet<BlockId>,
    /// Members plus the nodes emitted inside the scope without belonging to it.
    placement: BTreeSet<BlockId>,
}

impl Scope {
    /// Orders scopes inside-out; a loop nests inside a protected region of equal extent.
    fn nesting_key(&self) -> (usize, u8) {
        let rank = match self.kind {
            ScopeKind::Loop(_) => 0,
            ScopeKind::Try(_) => 1,
        };
        (self.placement.len(), rank)
    }
}

pub fn classify(context: &ClassifierContext) -> Result<Classification> {
    let dom = DominatorTree::compute(context.flow);
    let (loops, diagnostics) = find_natural_loops(context.flow, &dom);
    let mut classifier = Classifier {
        context,
        has_statements: context.built.blocks_with_statements(),
        dom,
        scopes: vec![],
        scope_sets: BTreeMap::new(),
        claimed: BTreeMap::new(),
        handler_code: BTreeSet::new(),
        diagnostics,
        next_scope: 0,
    };
    classifier.build_scopes(loops)?;
    classifier.assign_claimants()?;
    let region = classifier.build_regions()?;
    Ok(Classification {
        region,
        diagnostics: classifier.diagnostics,
        next_scope: classifier.next_scope,
    })
}

struct Classifier<'c, 'a> {
    context: &'c ClassifierContext<'a>,
    has_statements: BTreeSet<BlockId>,
    dom: DominatorTree,
    scopes: Vec<Scope>,
    /// Scopes whose placement contains each node.
    scope_sets: BTreeMap<BlockId, BTreeSet<usize>>,
    /// Nodes each node is responsible for placing, in reverse post-order.
    claimed: BTreeMap<BlockId, Vec<BlockId>>,
    /// Nodes dominated by some exception handler.
    handler_code: BTreeSet<BlockId>,
    diagnostics: Vec<Diagnostic>,
    next_scope: usize,
}

impl Classifier<'_, '_> {
    fn flow(&self) -> &FlowGraph {
        self.context.flow
    }

    fn fresh_scope(&mut self) -> usize {
        self.next_scope += 1;
        self.next_scope - 1
    }

    fn build_scopes(&mut self, loops: BTreeMap<BlockId, NaturalLoop>) -> Result<()> {
        let regions = self.protected_regions();
        self.handler_code = regions
            .iter()
            .flat_map(|(_, handlers)| handlers.iter())
            .flat_map(|(handler, _)| self.dom.subtree(*handler))
            .collect();

        for natural in loops.into_values() {
            let members: BTreeSet<BlockId> = natural
                .body
                .iter()
                .copied()
                .filter(|node| self.dom.is_reachable(*node))
                .collect();
            let mut tests: BTreeSet<BlockId> = self.flow().successors(natural.header).into_iter().collect();
            for latch in &natural.latches {
                tests.extend(self.flow().successors(*latch));
            }
            let entry = natural.header;
            let excluded = self.foreign_handler_code(&regions, entry, &members);
            let placement = self.placement(entry, &members, &excluded, &tests);
            self.scopes.push(Scope {
                kind: ScopeKind::Loop(natural),
                entry,
                members,
                placement,
            });
        }

        for (cover, handlers) in regions.iter().cloned() {
            let Some(&entry) = cover.iter().min_by_key(|node| self.dom.rpo_number(**node)) else {
                continue;
            };
            if let Some(stray) = cover.iter().find(|node| !self.dom.dominates(entry, **node)) {
                return Err(ReconstructionError::unsupported(
                    *stray,
                    format!("protected region starting at block {} has several entries", entry),
                ));
            }
            let excluded = self.foreign_handler_code(&regions, entry, &cover);
            let placement = self.placement(entry, &cover, &excluded, &BTreeSet::new());
            self.scopes.push(Scope {
                kind: ScopeKind::Try(handlers),
                entry,
                members: cover,
                placement,
            });
        }

        for (left, right) in self.scopes.iter().tuple_combinations() {
            let a = &left.placement;
            let b = &right.placement;
            if !a.is_disjoint(b) && !a.is_subset(b) && !b.is_subset(a) {
                return Err(ReconstructionError::unsupported(
                    left.entry,
                    format!(
                        "regions entered at blocks {} and {} overlap without nesting",
                        left.entry, right.entry
                    ),
                ));
            }
        }
        for (index, scope) in self.scopes.iter().enumerate() {
            for node in &scope.placement {
                self.scope_sets.entry(*node).or_default().insert(index);
            }
        }
        debug!("[Classifier::build_scopes] {} scopes", self.scopes.len());
        Ok(())
    }

    fn protected_regions(&self) -> Vec<ProtectedRegion> {
        let mut by_handler: Vec<(BlockId, Vec<Option<String>>, BTreeSet<BlockId>)> = vec![];
        for entry in self.context.graph.exception_table() {
            if entry.covers(entry.handler) {
                continue;
            }
            let covered = (entry.start..entry.end)
                .filter(|node| self.flow().contains(*node) && self.dom.is_reachable(*node));
            match by_handler.iter_mut().find(|(handler, ..)| *handler == entry.handler) {
                Some((_, types, cover)) => {
                    if !types.contains(&entry.catch_type) {
                        types.push(entry.catch_type.clone());
                    }
                    cover.extend(covered);
                }
                None => by_handler.push((
                    entry.handler,
                    vec![entry.catch_type.clone()],
                    covered.collect(),
                )),
            }
        }
        let mut regions: Vec<ProtectedRegion> = vec![];
        for (handler, types, cover) in by_handler {
            if cover.is_empty() || !self.dom.is_reachable(handler) {
                continue;
            }
            // catch (A | B e) shares one handler between several entries
            let catch_type = if types.iter().any(Option::is_none) {
                None
            } else {
                Some(types.into_iter().flatten().join(" | "))
            };
            match regions.iter_mut().find(|(other, _)| *other == cover) {
                Some((_, handlers)) => handlers.push((handler, catch_type)),
                None => regions.push((cover, vec![(handler, catch_type)])),
            }
        }
        regions
    }

    /// Handler code that never belongs inside a scope over `members`: the scope's own
    /// handlers and those of regions not nested strictly within it. Handlers enclosing
    /// the scope's entry are left alone.
    fn foreign_handler_code(
        &self,
        regions: &[ProtectedRegion],
        entry: BlockId,
        members: &BTreeSet<BlockId>,
    ) -> BTreeSet<BlockId> {
        regions
            .iter()
            .filter(|(cover, _)| cover == members || !cover.is_subset(members))
            .flat_map(|(_, handlers)| handlers.iter())
            .filter(|(handler, _)| !self.dom.dominates(*handler, entry))
            .flat_map(|(handler, _)| self.dom.subtree(*handler))
            .collect()
    }

    /// Nodes reachable from `start` without passing through `avoid`.
    fn reachable_avoiding(&self, start: BlockId, avoid: BlockId) -> BTreeSet<BlockId> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            if node == avoid || !seen.insert(node) {
                continue;
            }
            queue.extend(self.flow().all_successors(node));
        }
        seen
    }

    /// Picks the scope's follow and returns the nodes placed inside it.
    fn placement(
        &mut self,
        entry: BlockId,
        members: &BTreeSet<BlockId>,
        excluded: &BTreeSet<BlockId>,
        tests: &BTreeSet<BlockId>,
    ) -> BTreeSet<BlockId> {
        let candidates: BTreeSet<BlockId> = members
            .iter()
            .flat_map(|member| self.flow().successors(*member))
            .filter(|target| {
                !members.contains(target)
                    && !excluded.contains(target)
                    && *target != entry
                    && self.dom.dominates(entry, *target)
            })
            .collect();

        // Prefer the exit the other exits flow into; it needs no label to reach. Then
        // loop tests, then code outside catch bodies.
        let reach: BTreeMap<BlockId, BTreeSet<BlockId>> = candidates
            .iter()
            .map(|candidate| (*candidate, self.reachable_avoiding(*candidate, entry)))
            .collect();
        let score = |candidate: BlockId| {
            let joined = candidates
                .iter()
                .filter(|other| **other != candidate && reach[*other].contains(&candidate))
                .count();
            (
                joined,
                tests.contains(&candidate),
                !self.handler_code.contains(&candidate),
                candidate,
            )
        };
        let follow = candidates.iter().copied().max_by_key(|candidate| score(*candidate));
        if let Some(chosen) = follow {
            let rank = |candidate: BlockId| {
                let (joined, test, outside_handler, _) = score(candidate);
                (joined, test, outside_handler)
            };
            let best = rank(chosen);
            let tied = candidates.iter().filter(|other| rank(**other) == best).count();
            if tied > 1 {
                self.diagnostics.push(Diagnostic::AmbiguousClassification {
                    block: entry,
                    chosen: format!("follow at block {}", chosen),
                    alternatives: tied - 1,
                });
            }
        }

        let after = follow.map(|follow| self.reachable_avoiding(follow, entry)).unwrap_or_default();
        self.dom
            .subtree(entry)
            .into_iter()
            .filter(|node| members.contains(node) || (!excluded.contains(node) && !after.contains(node)))
            .collect()
    }

    fn assign_claimants(&mut self) -> Result<()> {
        let empty = BTreeSet::new();
        let order: Vec<BlockId> = self.dom.reverse_post_order().to_vec();
        for node in order {
            let Some(parent) = self.dom.idom(node) else {
                continue;
            };
            if parent == node {
                continue;
            }
            let parent_scopes = self.scope_sets.get(&parent).unwrap_or(&empty);
            let node_scopes = self.scope_sets.get(&node).unwrap_or(&empty);
            let left = parent_scopes
                .difference(node_scopes)
                .copied()
                .max_by_key(|index| self.scopes[*index].nesting_key());
            let claimant = match left {
                Some(index) => self.scopes[index].entry,
                None => parent,
            };
            self.claimed.entry(claimant).or_default().push(node);
        }

        for scope in &self.scopes {
            if let ScopeKind::Try(handlers) = &scope.kind {
                for (handler, _) in handlers {
                    let claimed_here = self
                        .claimed
                        .get(&scope.entry)
                        .is_some_and(|nodes| nodes.contains(handler));
                    if !claimed_here {
                        return Err(ReconstructionError::unsupported(
                            *handler,
                            format!("handler is reachable outside the region protected from block {}", scope.entry),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn build_regions(&mut self) -> Result<Region> {
        let mut regions: BTreeMap<BlockId, Region> = BTreeMap::new();
        let placed = self.place_regions(&mut regions);
        // Only a failed placement leaves regions behind.
        for region in std::mem::take(&mut regions).into_values() {
            region.dismantle();
        }
        let root = placed?;
        let depth = root.depth();
        if depth > MAX_NESTING_DEPTH {
            root.dismantle();
            return Err(ReconstructionError::unsupported(
                self.dom.entry(),
                format!(
                    "control structures nested {} levels deep, more than {}",
                    depth, MAX_NESTING_DEPTH
                ),
            ));
        }
        Ok(root)
    }

    fn place_regions(&mut self, regions: &mut BTreeMap<BlockId, Region>) -> Result<Region> {
        for node in self.dom.postorder() {
            let region = self.build_node(node, regions)?;
            regions.insert(node, region);
        }
        let entry = self.dom.entry();
        let root = regions
            .remove(&entry)
            .ok_or_else(|| ReconstructionError::structure(entry, None, "entry block was not placed"))?;
        if let Some(&stray) = regions.keys().next() {
            root.dismantle();
            return Err(ReconstructionError::structure(
                stray,
                None,
                "block was never placed in the region tree",
            ));
        }
        Ok(root)
    }

    fn build_node(&mut self, node: BlockId, regions: &mut BTreeMap<BlockId, Region>) -> Result<Region> {
        let mut scopes_here: Vec<usize> = (0..self.scopes.len())
            .filter(|index| self.scopes[*index].entry == node)
            .collect();
        scopes_here.sort_by_key(|index| self.scopes[*index].nesting_key());
        let level_of = |classifier: &Self, claimed: BlockId| {
            scopes_here
                .iter()
                .position(|index| classifier.scopes[*index].placement.contains(&claimed))
                .unwrap_or(scopes_here.len())
        };

        let Some(flow_node) = self.flow().node(node) else {
            return Err(ReconstructionError::structure(node, None, "block missing from flow graph"));
        };
        let exit = flow_node.exit.clone();
        let targets = exit.targets();
        let claimed = self.claimed.get(&node).cloned().unwrap_or_default();
        let handlers: BTreeSet<BlockId> = scopes_here
            .iter()
            .filter_map(|index| match &self.scopes[*index].kind {
                ScopeKind::Try(handlers) => Some(handlers.iter().map(|(handler, _)| *handler)),
                ScopeKind::Loop(_) => None,
            })
            .flatten()
            .collect();
        let switch_follow = match &exit {
            FlowExit::Switch(table) => self.switch_follow(node, table),
            _ => None,
        };

        let mut inline = BTreeSet::new();
        let mut followers: Vec<Vec<BlockId>> = vec![vec![]; scopes_here.len() + 1];
        for &child in &claimed {
            if handlers.contains(&child) {
                continue;
            }
            let level = level_of(self, child);
            let direct = level == 0 && targets.contains(&child);
            let inlined = match &exit {
                FlowExit::Switch(_) => direct && Some(child) != switch_follow,
                _ => direct && self.dom.forward_predecessors(child) == [node],
            };
            if inlined {
                inline.insert(child);
            } else {
                followers[level].push(child);
            }
        }
        for level in followers.iter_mut() {
            level.sort_by_key(|child| self.dom.rpo_number(*child));
        }

        let code = self.node_code(node, &exit, &inline, switch_follow, regions)?;
        let mut region = self.wrap_followers(code, &followers[0], regions)?;
        for (level, index) in scopes_here.iter().enumerate() {
            let scope = self.scopes[*index].clone();
            region = match &scope.kind {
                ScopeKind::Loop(natural) => self.wrap_loop(&scope, natural, region),
                ScopeKind::Try(handlers) => {
                    let mut catches: Vec<CatchArm> = vec![];
                    for (handler, catch_type) in handlers {
                        let Some(body) = regions.remove(handler) else {
                            region.dismantle();
                            for catch in catches {
                                catch.body.dismantle();
                            }
                            return Err(ReconstructionError::structure(
                                *handler,
                                None,
                                "handler region missing",
                            ));
                        };
                        catches.push(CatchArm {
                            catch_type: catch_type.clone(),
                            handler: *handler,
                            body,
                        });
                    }
                    Region::Try(TryRegion {
                        entry: node,
                        body: Box::new(region),
                        catches,
                    })
                }
            };
            region = self.wrap_followers(region, &followers[level + 1], regions)?;
        }
        Ok(region)
    }

    /// Where a region continues with `target`: inline when this node owns it,
    /// otherwise a jump resolved later.
    fn transfer(
        &self,
        node: BlockId,
        target: BlockId,
        inline: &BTreeSet<BlockId>,
        regions: &mut BTreeMap<BlockId, Region>,
    ) -> Region {
        if inline.contains(&target) {
            if let Some(region) = regions.remove(&target) {
                return region;
            }
        }
        Region::Jump { from: node, target }
    }

    fn node_code(
        &mut self,
        node: BlockId,
        exit: &FlowExit,
        inline: &BTreeSet<BlockId>,
        switch_follow: Option<BlockId>,
        regions: &mut BTreeMap<BlockId, Region>,
    ) -> Result<Region> {
        let ending = match exit {
            FlowExit::Terminal => Region::Terminal(node),
            FlowExit::Goto(target) => self.transfer(node, *target, inline, regions),
            FlowExit::Branch(decision) => {
                // then-arm first in block order, the way the source was laid out
                let decision = if decision.then_target > decision.else_target {
                    decision.clone().flipped()
                } else {
                    decision.clone()
                };
                let then_region = self.transfer(node, decision.then_target, inline, regions);
                let else_region = self.transfer(node, decision.else_target, inline, regions);
                Region::If {
                    block: node,
                    condition: decision.condition,
                    then_region: Box::new(then_region),
                    else_region: Box::new(else_region),
                }
            }
            FlowExit::Switch(table) => self.switch_region(node, table, inline, switch_follow, regions)?,
        };
        Ok(Region::Leaf(node).then(ending))
    }

    /// The default target when it is where the cases join again.
    fn switch_follow(&self, node: BlockId, table: &SwitchTable) -> Option<BlockId> {
        let highest = table.cases.iter().map(|(_, target)| *target).max()?;
        let joined = self
            .dom
            .forward_predecessors(table.default)
            .iter()
            .any(|pred| *pred != node);
        (table.default >= highest && joined).then_some(table.default)
    }

    fn switch_region(
        &mut self,
        node: BlockId,
        table: &SwitchTable,
        inline: &BTreeSet<BlockId>,
        switch_follow: Option<BlockId>,
        regions: &mut BTreeMap<BlockId, Region>,
    ) -> Result<Region> {
        // Labels first: a failure here must not leave arms half taken out of `regions`.
        let labels = self.case_labels(node, table)?;
        let mut grouped: BTreeMap<BlockId, Vec<CaseLabel>> = BTreeMap::new();
        for ((_, target), label) in table.cases.iter().zip(labels) {
            grouped.entry(*target).or_default().push(label);
        }
        grouped.entry(table.default).or_default().push(CaseLabel::Default);

        let mut targets: Vec<BlockId> = grouped.keys().copied().collect();
        if let Some(follow) = switch_follow {
            targets.retain(|target| *target != follow);
            targets.push(follow);
        }
        let arms = targets
            .into_iter()
            .map(|target| SwitchArm {
                labels: grouped.remove(&target).unwrap_or_default(),
                target,
                body: self.transfer(node, target, inline, regions),
                fall_through: false,
            })
            .collect();
        Ok(Region::Switch(SwitchRegion {
            scope: self.fresh_scope(),
            block: node,
            arms,
            exit: switch_follow,
        }))
    }

    /// One label per entry of `table.cases`, in order.
    fn case_labels(&self, node: BlockId, table: &SwitchTable) -> Result<Vec<CaseLabel>> {
        let selector = match self.context.built.blocks.get(&node).map(|summary| &summary.exit) {
            Some(ExitExpression::Switch(selector)) => Some(selector),
            _ => None,
        };
        if let Some(switch_table) = selector.and_then(enum_switch_table) {
            return self.table_labels(node, table, &switch_table);
        }
        let keys = table.cases.iter().map(|(key, _)| *key);
        Ok(match &table.decoding {
            CaseDecoding::Integer if selector.is_some_and(|selector| selector.ty == SemanticType::Char) => {
                keys.map(|key| u16::try_from(key).map(CaseLabel::Char).unwrap_or(CaseLabel::Int(key)))
                    .collect()
            }
            CaseDecoding::Integer => keys.map(CaseLabel::Int).collect(),
            // All or nothing: one numeric label would make `switch (e)` wrong.
            CaseDecoding::EnumOrdinal { enum_type } => {
                let constants = self.context.types.enum_constants(enum_type).unwrap_or_default();
                keys.clone()
                    .map(|key| {
                        let constant = constants.get(usize::try_from(key).ok()?)?;
                        Some(CaseLabel::Enum {
                            enum_type: enum_type.clone(),
                            constant: constant.clone(),
                        })
                    })
                    .collect::<Option<Vec<_>>>()
                    .unwrap_or_else(|| keys.map(CaseLabel::Int).collect())
            }
            CaseDecoding::Strings { labels } => keys
                .clone()
                .map(|key| labels.get(&key).map(|label| CaseLabel::String(label.clone())))
                .collect::<Option<Vec<_>>>()
                .unwrap_or_else(|| keys.map(CaseLabel::Int).collect()),
        })
    }

    /// Labels of a switch on a compiler-generated enum table. Keys that cannot be mapped
    /// back to a constant fail the method rather than produce wrong labels.
    fn table_labels(
        &self,
        node: BlockId,
        table: &SwitchTable,
        switch_table: &EnumSwitchTable,
    ) -> Result<Vec<CaseLabel>> {
        let enum_type = &switch_table.enum_type;
        let names: BTreeMap<i32, String> = match switch_table.kind {
            TableKind::SwitchMap { owner, field } => {
                self.context.types.switch_map(owner, field).ok_or_else(|| {
                    ReconstructionError::unsupported(
                        node,
                        format!("switch over `{}` through `{}.{}` with unknown contents", enum_type, owner, field),
                    )
                })?
            }
            TableKind::SwitchTable => self
                .context
                .types
                .enum_constants(enum_type)
                .ok_or_else(|| {
                    ReconstructionError::unsupported(node, format!("switch over unknown enum `{}`", enum_type))
                })?
                .into_iter()
                .zip(1..)
                .map(|(constant, key)| (key, constant))
                .collect(),
        };
        table
            .cases
            .iter()
            .map(|(key, _)| {
                let constant = names.get(key).ok_or_else(|| {
                    ReconstructionError::unsupported(
                        node,
                        format!("switch key {} matches no constant of `{}`", key, enum_type),
                    )
                })?;
                Ok(CaseLabel::Enum {
                    enum_type: enum_type.clone(),
                    constant: constant.clone(),
                })
            })
            .collect()
    }

    /// `Seq[Block_fn{ .. Seq[Block_f1{code}, f1] .. }, fn]`: each follower comes after a
    /// breakable block that jumps to it can leave.
    fn wrap_followers(
        &mut self,
        code: Region,
        followers: &[BlockId],
        regions: &mut BTreeMap<BlockId, Region>,
    ) -> Result<Region> {
        let mut region = code;
        for &follower in followers {
            if self.flow().is_handler(follower) {
                region.dismantle();
                return Err(ReconstructionError::unsupported(
                    follower,
                    "exception handler placed in normal control flow",
                ));
            }
            let Some(next) = regions.remove(&follower) else {
                region.dismantle();
                return Err(ReconstructionError::structure(follower, None, "follower region missing"));
            };
            let header = region.entry().unwrap_or(follower);
            let wrapper = Region::Loop(LoopRegion {
                scope: self.fresh_scope(),
                kind: LoopKind::Headerless,
                header,
                condition: None,
                body: Box::new(region),
                update: None,
                continue_target: header,
                exit: Some(follower),
                synthetic: true,
            });
            region = wrapper.then(next);
        }
        Ok(region)
    }

    fn exit_sources(&self, members: &BTreeSet<BlockId>) -> BTreeSet<BlockId> {
        members
            .iter()
            .copied()
            .filter(|member| {
                self.flow()
                    .successors(*member)
                    .iter()
                    .any(|target| !members.contains(target))
            })
            .collect()
    }

    fn wrap_loop(&mut self, scope: &Scope, natural: &NaturalLoop, body: Region) -> Region {
        let header = scope.entry;
        let scope_id = self.fresh_scope();
        let headerless = |body: Region| {
            Region::Loop(LoopRegion {
                scope: scope_id,
                kind: LoopKind::Headerless,
                header,
                condition: None,
                body: Box::new(body),
                update: None,
                continue_target: header,
                exit: None,
                synthetic: false,
            })
        };
        if natural.irreducible {
            return headerless(body);
        }
        let members = &scope.members;
        let sources = self.exit_sources(members);
        let outside = |target: &BlockId| !members.contains(target);

        // while (c) { .. } / for (..; c; u) { .. }
        let header_test = match self.flow().node(header).map(|node| &node.exit) {
            Some(FlowExit::Branch(decision)) => Some(decision.clone()),
            _ => None,
        };
        if let Some(decision) = header_test {
            let exits: Vec<BlockId> = [decision.then_target, decision.else_target]
                .into_iter()
                .filter(outside)
                .collect();
            let pre_test_shape = !self.has_statements.contains(&header)
                && exits.len() == 1
                && sources.iter().all(|source| *source == header)
                && scope.placement.len() == members.len();
            if pre_test_shape {
                let exit = exits[0];
                match split_header_test(body, header, exit) {
                    Ok((condition, inside)) => {
                        let (inside, update, continue_target) = self.split_update(natural, inside);
                        return Region::Loop(LoopRegion {
                            scope: scope_id,
                            kind: LoopKind::PreTest,
                            header,
                            condition: Some(condition),
                            body: Box::new(inside),
                            update: update.map(Box::new),
                            continue_target,
                            exit: Some(exit),
                            synthetic: false,
                        })
                        .then(Region::Jump { from: header, target: exit });
                    }
                    Err(body) => {
                        self.degraded(header, "pre-test loop");
                        return headerless(body);
                    }
                }
            }
        }

        // do { .. } while (c)
        if let [latch] = natural.latches.iter().copied().collect::<Vec<_>>()[..] {
            let latch_test = match self.flow().node(latch).map(|node| &node.exit) {
                Some(FlowExit::Branch(decision)) => Some(decision.clone()),
                _ => None,
            };
            if let Some(decision) = latch_test {
                let targets = [decision.then_target, decision.else_target];
                let exits: Vec<BlockId> = targets.into_iter().filter(outside).collect();
                let post_test_shape = targets.contains(&header)
                    && exits.len() == 1
                    && sources.iter().all(|source| *source == latch)
                    && (latch == header
                        || !self.has_statements.contains(&latch)
                        || self.dom.forward_predecessors(latch).len() == 1);
                if post_test_shape {
                    let exit = exits[0];
                    match split_latch_test(body, latch, header, exit) {
                        Ok((condition, inside)) => {
                            return Region::Loop(LoopRegion {
                                scope: scope_id,
                                kind: LoopKind::PostTest,
                                header,
                                condition: Some(condition),
                                body: Box::new(inside),
                                update: None,
                                continue_target: latch,
                                exit: Some(exit),
                                synthetic: false,
                            })
                            .then(Region::Jump { from: latch, target: exit });
                        }
                        Err(body) => {
                            self.degraded(header, "post-test loop");
                            return headerless(body);
                        }
                    }
                }
            }
        }
        headerless(body)
    }

    fn degraded(&mut self, header: BlockId, wanted: &str) {
        warn!(
            "[Classifier::wrap_loop] {} at block {} has an unexpected shape, kept headerless",
            wanted, header
        );
        self.diagnostics.push(Diagnostic::AmbiguousClassification {
            block: header,
            chosen: "headerless loop".to_string(),
            alternatives: 1,
        });
    }

    /// Moves the statements of a shared latch into a `for` update clause.
    fn split_update(&self, natural: &NaturalLoop, inside: Region) -> (Region, Option<Region>, BlockId) {
        let header = natural.header;
        let latch = match natural.latches.iter().copied().collect::<Vec<_>>()[..] {
            [latch] if latch != header => latch,
            _ => return (inside, None, header),
        };
        let is_update = self.context.options.recognize_for_loops
            && matches!(self.flow().node(latch).map(|node| &node.exit), Some(FlowExit::Goto(target)) if *target == header)
            && self.dom.forward_predecessors(latch).len() >= 2
            && self.context.built.blocks.get(&latch).is_some_and(|summary| {
                !summary.statements.is_empty() && summary.statements.iter().all(is_update_statement)
            });
        if !is_update {
            return (inside, None, header);
        }
        let mut items = inside.into_items();
        let tail_matches = matches!(
            &items[..],
            [.., Region::Leaf(leaf), Region::Jump { from, target }]
                if *leaf == latch && *from == latch && *target == header
        );
        if !tail_matches {
            return (Region::Sequence(items), None, header);
        }
        items.truncate(items.len() - 2);
        (Region::Sequence(items), Some(Region::Leaf(latch)), latch)
    }
}

fn is_update_statement(statement: &Statement) -> bool {
    matches!(
        statement,
        Statement::Expression(expr)
            if matches!(expr.kind, ExpressionKind::Assignment { .. } | ExpressionKind::Increment { .. })
    )
}

fn is_jump(region: &Region, from: BlockId, to: BlockId) -> bool {
    matches!(region, Region::Jump { from: source, target } if *source == from && *target == to)
}

/// Splits `Seq[Leaf(h), If{h, ..}]` into the loop condition and the body arm.
fn split_header_test(body: Region, header: BlockId, exit: BlockId) -> std::result::Result<(Condition, Region), Region> {
    let items = body.into_items();
    let shape_ok = matches!(
        &items[..],
        [Region::Leaf(leaf), Region::If { block, then_region, else_region, .. }]
            if *leaf == header && *block == header
                && (is_jump(then_region, header, exit) != is_jump(else_region, header, exit))
    );
    if !shape_ok {
        return Err(Region::Sequence(items));
    }
    let mut items = items;
    match items.pop() {
        Some(Region::If {
            condition,
            then_region,
            else_region,
            ..
        }) => {
            if is_jump(&then_region, header, exit) {
                Ok((condition.negated(), *else_region))
            } else {
                Ok((condition, *then_region))
            }
        }
        Some(other) => {
            items.push(other);
            Err(Region::Sequence(items))
        }
        None => Err(Region::Sequence(items)),
    }
}

/// Removes the trailing `If{latch}` that jumps back to the header or leaves the loop.
fn split_latch_test(
    body: Region,
    latch: BlockId,
    header: BlockId,
    exit: BlockId,
) -> std::result::Result<(Condition, Region), Region> {
    let mut items = body.into_items();
    let shape_ok = matches!(
        items.last(),
        Some(Region::If { block, then_region, else_region, .. })
            if *block == latch
                && ((is_jump(then_region, latch, header) && is_jump(else_region, latch, exit))
                    || (is_jump(then_region, latch, exit) && is_jump(else_region, latch, header)))
    );
    if !shape_ok {
        return Err(Region::Sequence(items));
    }
    match items.pop() {
        Some(Region::If {
            condition,
            then_region,
            ..
        }) => {
            let condition = if is_jump(&then_region, latch, header) {
                condition
            } else {
                condition.negated()
            };
            Ok((condition, Region::Sequence(items)))
        }
        Some(other) => {
            items.push(other);
            Err(Region::Sequence(items))
        }
        None => Err(Region::Sequence(items)),
    }
}
