// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

//! Turns the jumps left by classification into fallthrough, `break`, `continue` or
//! an inlined return, adding labels only where an unlabeled transfer would reach
//! the wrong statement.

use super::region::{LoopRegion, Region, SwitchRegion, TryRegion};
use crate::bytecode::BlockId;
use crate::error::{Diagnostic, ReconstructionError, RegionPath, Result};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug)]
pub struct ResolvedRegion {
    pub region: Region,
    /// Label names of the loops and switches a labeled transfer refers to.
    pub labels: BTreeMap<usize, String>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Resolves every `Region::Jump`. `inline_terminal` tells whether a jump to a block
/// may be replaced by a copy of that block's return.
pub fn resolve_jumps(
    region: Region,
    inline_terminal: &dyn Fn(BlockId) -> bool,
    label_prefix: &str,
) -> Result<ResolvedRegion> {
    // First pass only finds out which breakable blocks are really needed.
    let mut dry_run = Resolver::new(inline_terminal);
    dry_run.resolve(region.clone(), None, &RegionPath::root())?;
    let region = dissolve_wrappers(region, &dry_run.broken);

    let mut resolver = Resolver::new(inline_terminal);
    let region = resolver.resolve(region, None, &RegionPath::root())?;

    let mut labels = BTreeMap::new();
    let mut diagnostics = vec![];
    region.walk(&mut |region| match region {
        Region::Loop(LoopRegion { scope, .. }) | Region::Switch(SwitchRegion { scope, .. })
            if resolver.labeled.contains(scope) =>
        {
            let name = format!("{}{}", label_prefix, labels.len());
            labels.insert(*scope, name);
        }
        _ => {}
    });
    region.walk(&mut |region| {
        if let Region::Loop(LoopRegion {
            synthetic: true,
            header,
            ..
        }) = region
        {
            diagnostics.push(Diagnostic::UnstructuredGraph {
                block: *header,
                detail: "forward jump needs a breakable block".to_string(),
            });
        }
    });
    debug!(
        "[resolve_jumps] {} labels, {} breakable blocks kept",
        labels.len(),
        diagnostics.len()
    );
    Ok(ResolvedRegion {
        region,
        labels,
        diagnostics,
    })
}

#[derive(Debug, Clone, Copy)]
enum FrameKind {
    /// `None` for breakable blocks, which cannot be continued.
    Loop { continue_target: Option<BlockId> },
    Switch,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    scope: usize,
    kind: FrameKind,
    /// Where control goes after the statement; what `break` reaches.
    next: Option<BlockId>,
}

struct Resolver<'a> {
    frames: Vec<Frame>,
    inline_terminal: &'a dyn Fn(BlockId) -> bool,
    broken: BTreeSet<usize>,
    labeled: BTreeSet<usize>,
}

impl<'a> Resolver<'a> {
    fn new(inline_terminal: &'a dyn Fn(BlockId) -> bool) -> Self {
        Self {
            frames: vec![],
            inline_terminal,
            broken: BTreeSet::new(),
            labeled: BTreeSet::new(),
        }
    }

    /// Entry of the first non-empty region in `rest`, or `next` after them.
    fn following(rest: &[Option<BlockId>], next: Option<BlockId>) -> Option<BlockId> {
        rest.iter().find_map(|entry| *entry).or(next)
    }

    fn resolve(&mut self, region: Region, next: Option<BlockId>, path: &RegionPath) -> Result<Region> {
        let path = path.child(region.path_segment());
        Ok(match region {
            Region::Sequence(items) => {
                let entries: Vec<Option<BlockId>> = items.iter().map(Region::entry).collect();
                let mut resolved = Vec::with_capacity(items.len());
                for (index, item) in items.into_iter().enumerate() {
                    let item_next = Self::following(&entries[index + 1..], next);
                    resolved.push(self.resolve(item, item_next, &path)?);
                }
                Region::Sequence(resolved).then(Region::empty())
            }
            Region::If {
                block,
                condition,
                then_region,
                else_region,
            } => Region::If {
                block,
                condition,
                then_region: Box::new(self.resolve(*then_region, next, &path)?),
                else_region: Box::new(self.resolve(*else_region, next, &path)?),
            },
            Region::Loop(mut region) => {
                let continue_target = (!region.synthetic).then_some(region.continue_target);
                self.frames.push(Frame {
                    scope: region.scope,
                    kind: FrameKind::Loop { continue_target },
                    next,
                });
                let body_next = if region.synthetic { next } else { continue_target };
                region.body = Box::new(self.resolve(*region.body, body_next, &path)?);
                if let Some(update) = region.update.take() {
                    region.update = Some(Box::new(self.resolve(*update, Some(region.header), &path)?));
                }
                self.frames.pop();
                Region::Loop(region)
            }
            Region::Switch(mut switch) => {
                self.frames.push(Frame {
                    scope: switch.scope,
                    kind: FrameKind::Switch,
                    next,
                });
                let entries: Vec<Option<BlockId>> = switch.arms.iter().map(|arm| arm.body.entry()).collect();
                for (index, arm) in switch.arms.iter_mut().enumerate() {
                    let body = std::mem::replace(&mut arm.body, Region::empty());
                    let arm_next = Self::following(&entries[index + 1..], next);
                    arm.body = self.resolve(body, arm_next, &path)?;
                }
                self.frames.pop();
                Region::Switch(switch)
            }
            Region::Try(TryRegion {
                entry,
                body,
                catches,
            }) => {
                let body = self.resolve(*body, next, &path)?;
                let mut resolved = Vec::with_capacity(catches.len());
                for mut catch in catches {
                    catch.body = self.resolve(catch.body, next, &path)?;
                    resolved.push(catch);
                }
                Region::Try(TryRegion {
                    entry,
                    body: Box::new(body),
                    catches: resolved,
                })
            }
            Region::Jump { from, target } => self.resolve_jump(from, target, next, &path)?,
            Region::Break { scope, labeled } => {
                self.broken.insert(scope);
                if labeled {
                    self.labeled.insert(scope);
                }
                Region::Break { scope, labeled }
            }
            Region::Continue { scope, labeled } => {
                if labeled {
                    self.labeled.insert(scope);
                }
                Region::Continue { scope, labeled }
            }
            leaf @ (Region::Leaf(_) | Region::Terminal(_)) => leaf,
        })
    }

    fn resolve_jump(
        &mut self,
        from: BlockId,
        target: BlockId,
        next: Option<BlockId>,
        path: &RegionPath,
    ) -> Result<Region> {
        if next == Some(target) {
            return Ok(Region::empty());
        }

        let innermost_loop = self
            .frames
            .iter()
            .rposition(|frame| matches!(frame.kind, FrameKind::Loop { .. }));
        let continued = self.frames.iter().rposition(|frame| {
            matches!(frame.kind, FrameKind::Loop { continue_target: Some(continue_target) } if continue_target == target)
        });
        if let Some(index) = continued {
            let scope = self.frames[index].scope;
            let labeled = Some(index) != innermost_loop;
            if labeled {
                self.labeled.insert(scope);
            }
            return Ok(Region::Continue { scope, labeled });
        }

        let broken = self
            .frames
            .iter()
            .rposition(|frame| frame.next == Some(target));
        let innermost = self.frames.len().checked_sub(1);
        match broken {
            Some(index) if Some(index) == innermost => {
                let scope = self.frames[index].scope;
                self.broken.insert(scope);
                Ok(Region::Break {
                    scope,
                    labeled: false,
                })
            }
            _ if (self.inline_terminal)(target) => Ok(Region::Terminal(target)),
            Some(index) => {
                let scope = self.frames[index].scope;
                self.broken.insert(scope);
                self.labeled.insert(scope);
                Ok(Region::Break {
                    scope,
                    labeled: true,
                })
            }
            None => Err(ReconstructionError::structure_at(
                from,
                path.clone(),
                format!("no structured transfer from block {} to block {}", from, target),
            )),
        }
    }
}

/// Replaces breakable blocks nothing breaks out of with their contents.
fn dissolve_wrappers(region: Region, keep: &BTreeSet<usize>) -> Region {
    match region {
        Region::Loop(region) if region.synthetic && !keep.contains(&region.scope) => {
            dissolve_wrappers(*region.body, keep)
        }
        Region::Loop(mut region) => {
            region.body = Box::new(dissolve_wrappers(*region.body, keep));
            region.update = region
                .update
                .map(|update| Box::new(dissolve_wrappers(*update, keep)));
            Region::Loop(region)
        }
        Region::Sequence(items) => items
            .into_iter()
            .map(|item| dissolve_wrappers(item, keep))
            .fold(Region::empty(), Region::then),
        Region::If {
            block,
            condition,
            then_region,
            else_region,
        } => Region::If {
            block,
            condition,
            then_region: Box::new(dissolve_wrappers(*then_region, keep)),
            else_region: Box::new(dissolve_wrappers(*else_region, keep)),
        },
        Region::Switch(mut switch) => {
            for arm in switch.arms.iter_mut() {
                let body = std::mem::replace(&mut arm.body, Region::empty());
                arm.body = dissolve_wrappers(body, keep);
            }
            Region::Switch(switch)
        }
        Region::Try(mut region) => {
            region.body = Box::new(dissolve_wrappers(*region.body, keep));
            for catch in region.catches.iter_mut() {
                let body = std::mem::replace(&mut catch.body, Region::empty());
                catch.body = dissolve_wrappers(body, keep);
            }
            Region::Try(region)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_flow_reconstruction::region::{Condition, LoopKind};

    fn never(_: BlockId) -> bool {
        false
    }

    fn branch(block: BlockId, then_region: Region, else_region: Region) -> Region {
        Region::If {
            block,
            condition: Condition::Branch(block),
            then_region: Box::new(then_region),
            else_region: Box::new(else_region),
        }
    }

    fn looped(scope: usize, header: BlockId, body: Region, synthetic: bool) -> Region {
        Region::Loop(LoopRegion {
            scope,
            kind: LoopKind::Headerless,
            header,
            condition: None,
            body: Box::new(body),
            update: None,
            continue_target: header,
            exit: None,
            synthetic,
        })
    }

    #[test]
    fn test_unused_wrapper_dissolves() {
        // if (b0) {} else { b1 } b2
        let wrapper = looped(
            0,
            0,
            Region::Leaf(0).then(branch(
                0,
                Region::Jump { from: 0, target: 2 },
                Region::Leaf(1).then(Region::Jump { from: 1, target: 2 }),
            )),
            true,
        );
        let region = wrapper.then(Region::Leaf(2)).then(Region::Terminal(2));
        let resolved = resolve_jumps(region, &never, "label").unwrap();
        let mut loops = 0;
        resolved.region.walk(&mut |region| {
            if matches!(region, Region::Loop(_)) {
                loops += 1;
            }
        });
        assert_eq!(loops, 0);
        assert!(resolved.labels.is_empty());
        assert!(resolved.diagnostics.is_empty());
    }

    #[test]
    fn test_break_and_continue_inside_loop() {
        let body = Region::Leaf(1).then(branch(
            1,
            Region::Jump { from: 1, target: 3 },
            Region::Leaf(2).then(Region::Jump { from: 2, target: 1 }),
        ));
        let region = looped(0, 1, body, false)
            .then(Region::Leaf(3))
            .then(Region::Terminal(3));
        let resolved = resolve_jumps(region, &never, "label").unwrap();
        let mut found = vec![];
        resolved.region.walk(&mut |region| {
            if matches!(region, Region::Break { .. } | Region::Continue { .. }) {
                found.push(region.clone());
            }
        });
        // the jump back to the header at the end of the body is plain fallthrough
        assert_eq!(
            found,
            vec![Region::Break {
                scope: 0,
                labeled: false
            }]
        );
    }

    #[test]
    fn test_break_out_of_nested_loop_is_labeled() {
        let inner = looped(
            1,
            2,
            Region::Leaf(2).then(branch(
                2,
                Region::Jump { from: 2, target: 4 },
                Region::Jump { from: 2, target: 2 },
            )),
            false,
        );
        let outer = looped(0, 1, Region::Leaf(1).then(inner).then(Region::Jump { from: 3, target: 1 }), false);
        let region = outer.then(Region::Leaf(4)).then(Region::Terminal(4));
        let resolved = resolve_jumps(region, &never, "label").unwrap();
        assert_eq!(resolved.labels, BTreeMap::from([(0, "label0".to_string())]));
        let mut labeled = vec![];
        resolved.region.walk(&mut |region| {
            if let Region::Break { scope, labeled: true } = region {
                labeled.push(*scope);
            }
        });
        assert_eq!(labeled, vec![0]);
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let inner = looped(
            1,
            2,
            Region::Leaf(2).then(branch(
                2,
                Region::Jump { from: 2, target: 4 },
                Region::Jump { from: 2, target: 2 },
            )),
            false,
        );
        let outer = looped(0, 1, Region::Leaf(1).then(inner), false);
        let region = outer.then(Region::Leaf(4)).then(Region::Terminal(4));
        let first = resolve_jumps(region, &never, "label").unwrap();
        let second = resolve_jumps(first.region.clone(), &never, "label").unwrap();
        assert_eq!(first.region, second.region);
        assert_eq!(first.labels, second.labels);
    }

    #[test]
    fn test_jump_to_return_is_inlined() {
        let inline = |block: BlockId| block == 9;
        let with_return = Region::Leaf(7).then(branch(
            7,
            Region::Jump { from: 7, target: 9 },
            Region::Terminal(7),
        ));
        let resolved = resolve_jumps(with_return, &inline, "label").unwrap();
        let mut terminals = vec![];
        resolved.region.walk(&mut |region| {
            if let Region::Terminal(block) = region {
                terminals.push(*block);
            }
        });
        assert_eq!(terminals, vec![9, 7]);
    }

    #[test]
    fn test_unresolvable_jump_reports_region_path() {
        let region = Region::Leaf(0).then(branch(
            0,
            Region::Jump { from: 0, target: 9 },
            Region::Terminal(0),
        ));
        let error = resolve_jumps(region, &never, "label").unwrap_err();
        let ReconstructionError::Structure(error) = error else {
            panic!("expected a structure error");
        };
        assert_eq!(error.block, 0);
        assert!(error.region_path.to_string().contains("if@0"));
    }
}
