// Copyright (c) Asymptotic Labs
// SPDX-License-Identifier: Apache-2.0

//! Compiler-generated indirection in a `switch` over an enum value.
//!
//! javac switches on `Owner.$SwitchMap$E[e.ordinal()]`, an array a synthetic class fills
//! with 1, 2, .. in the order the cases first appear in source. Eclipse switches on
//! `Owner.$SWITCH_TABLE$E()[e.ordinal()]`, whose entries are the ordinal plus one.

use super::node::{ExpressionKind, ExpressionNode};
use crate::types::SemanticType;

const JAVAC_TABLE: &str = "$SwitchMap$";
const ECLIPSE_TABLE: &str = "$SWITCH_TABLE$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind<'a> {
    /// Keys are whatever the static initializer of `owner.field` stored.
    SwitchMap { owner: &'a str, field: &'a str },
    /// Keys are ordinals plus one.
    SwitchTable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumSwitchTable<'a> {
    pub kind: TableKind<'a>,
    pub enum_type: String,
    /// `e` in `e.ordinal()`.
    pub value: &'a ExpressionNode,
}

pub fn enum_switch_table(selector: &ExpressionNode) -> Option<EnumSwitchTable<'_>> {
    let ExpressionKind::ArrayAccess { array, index } = &selector.kind else {
        return None;
    };
    let (value, ordinal_owner) = ordinal_receiver(index)?;
    let kind = match &array.kind {
        ExpressionKind::Field { target: None, field } if field.name.starts_with(JAVAC_TABLE) => {
            TableKind::SwitchMap {
                owner: &field.owner,
                field: &field.name,
            }
        }
        ExpressionKind::MethodCall {
            method,
            receiver: None,
            arguments,
            ..
        } if method.name.starts_with(ECLIPSE_TABLE) && arguments.is_empty() => TableKind::SwitchTable,
        _ => return None,
    };
    let enum_type = match &value.ty {
        SemanticType::Object(name) => name.clone(),
        _ => ordinal_owner.to_string(),
    };
    Some(EnumSwitchTable {
        kind,
        enum_type,
        value,
    })
}

/// `e` and the declaring class of `ordinal` for `e.ordinal()`.
fn ordinal_receiver(node: &ExpressionNode) -> Option<(&ExpressionNode, &str)> {
    match &node.kind {
        ExpressionKind::MethodCall {
            method,
            receiver: Some(receiver),
            arguments,
            ..
        } if method.name == "ordinal" && arguments.is_empty() => Some((receiver, &method.owner)),
        _ => None,
    }
}

/// `switch (T.$SwitchMap$E[e.ordinal()])` and `switch (e.ordinal())` are both written
/// `switch (e)`. Any other selector is returned unchanged.
pub fn enum_selector(selector: ExpressionNode) -> ExpressionNode {
    let selector = match selector.kind {
        ExpressionKind::ArrayAccess { array, index } if is_table(&array) => *index,
        kind => ExpressionNode::new(kind, selector.ty),
    };
    match selector.kind {
        ExpressionKind::MethodCall {
            method,
            receiver: Some(receiver),
            arguments,
            ..
        } if method.name == "ordinal" && arguments.is_empty() => *receiver,
        kind => ExpressionNode::new(kind, selector.ty),
    }
}

fn is_table(array: &ExpressionNode) -> bool {
    match &array.kind {
        ExpressionKind::Field { target: None, field } => field.name.starts_with(JAVAC_TABLE),
        ExpressionKind::MethodCall {
            method,
            receiver: None,
            arguments,
            ..
        } => method.name.starts_with(ECLIPSE_TABLE) && arguments.is_empty(),
        _ => false,
    }
}
