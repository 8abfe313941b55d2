//! Expression tree compilation
//!
//! Compiles a wire condition tree into a densely packed arena. Two passes:
//! a depth-limited node count sizes the arena exactly, then a depth-first
//! serialization fills it, linking children by index. The arena never grows
//! after compilation, so indices stay valid for the lifetime of the
//! campaign.

use super::description::{
    ConditionNodeDescription, OperatorDescription, WindowTypeDescription,
};
use crate::types::{SignalId, SignalPath};
use sha1::{Digest, Sha1};
use tracing::{trace, warn};

/// Maximum tree depth accepted from the cloud.
pub const MAX_EQUATION_DEPTH: u32 = 10;

/// Stable index of a node in its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeIdx(pub u32);

/// Internal operator kinds, mapped one-to-one from the wire enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Smaller,
    Bigger,
    SmallerEqual,
    BiggerEqual,
    Equal,
    NotEqual,
    LogicalAnd,
    LogicalOr,
    LogicalNot,
    Plus,
    Minus,
    Multiply,
    Divide,
}

impl From<OperatorDescription> for Operator {
    fn from(op: OperatorDescription) -> Self {
        match op {
            OperatorDescription::Smaller => Operator::Smaller,
            OperatorDescription::Bigger => Operator::Bigger,
            OperatorDescription::SmallerEqual => Operator::SmallerEqual,
            OperatorDescription::BiggerEqual => Operator::BiggerEqual,
            OperatorDescription::Equal => Operator::Equal,
            OperatorDescription::NotEqual => Operator::NotEqual,
            OperatorDescription::LogicalAnd => Operator::LogicalAnd,
            OperatorDescription::LogicalOr => Operator::LogicalOr,
            OperatorDescription::LogicalNot => Operator::LogicalNot,
            OperatorDescription::Plus => Operator::Plus,
            OperatorDescription::Minus => Operator::Minus,
            OperatorDescription::Multiply => Operator::Multiply,
            OperatorDescription::Divide => Operator::Divide,
        }
    }
}

/// Fixed-window aggregation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowFunction {
    LastMin,
    LastMax,
    LastAvg,
    PrevMin,
    PrevMax,
    PrevAvg,
}

impl From<WindowTypeDescription> for WindowFunction {
    fn from(window: WindowTypeDescription) -> Self {
        match window {
            WindowTypeDescription::LastMin => WindowFunction::LastMin,
            WindowTypeDescription::LastMax => WindowFunction::LastMax,
            WindowTypeDescription::LastAvg => WindowFunction::LastAvg,
            WindowTypeDescription::PrevMin => WindowFunction::PrevMin,
            WindowTypeDescription::PrevMax => WindowFunction::PrevMax,
            WindowTypeDescription::PrevAvg => WindowFunction::PrevAvg,
        }
    }
}

/// One compiled node. Children are arena indices, never pointers.
#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionNode {
    Signal(SignalId),
    Float(f64),
    Bool(bool),
    StringLiteral(String),
    Operator {
        op: Operator,
        left: NodeIdx,
        /// Unary NOT has no right child.
        right: Option<NodeIdx>,
    },
    WindowFunction {
        signal_id: SignalId,
        function: WindowFunction,
    },
    CustomFunction {
        name: String,
        invocation_id: u64,
        params: Vec<NodeIdx>,
    },
    IsNull {
        expression: NodeIdx,
    },
}

/// Densely packed node storage with frozen capacity.
#[derive(Debug, Default, PartialEq)]
pub struct ExpressionArena {
    nodes: Vec<ExpressionNode>,
}

impl ExpressionArena {
    pub fn node(&self, idx: NodeIdx) -> &ExpressionNode {
        &self.nodes[idx.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Count the nodes reachable within the depth limit. Mirrors the shape of
/// the serialization pass so the arena capacity is exact.
pub fn count_nodes(node: &ConditionNodeDescription, depth: u32) -> u32 {
    if depth == 0 {
        return 0;
    }
    let mut sum = 1;
    match node {
        ConditionNodeDescription::Operator { left, right, .. } => {
            if let Some(left) = left {
                sum += count_nodes(left, depth - 1);
            }
            if let Some(right) = right {
                sum += count_nodes(right, depth - 1);
            }
        }
        ConditionNodeDescription::CustomFunction { params, .. } => {
            for param in params {
                sum += count_nodes(param, depth - 1);
            }
        }
        ConditionNodeDescription::IsNull { expression } => {
            if let Some(expression) = expression {
                sum += count_nodes(expression, depth - 1);
            }
        }
        _ => {}
    }
    sum
}

/// Derive the deterministic invocation id for a custom-function node: the
/// first 8 bytes of `SHA-1(campaign_sync_id ":" invocation_index)`, read as
/// two 32-bit words.
fn invocation_id(campaign_sync_id: &str, invocation_index: u32) -> u64 {
    let mut hasher = Sha1::new();
    hasher.update(campaign_sync_id.as_bytes());
    hasher.update(b":");
    hasher.update(invocation_index.to_string().as_bytes());
    let digest = hasher.finalize();
    let word0 = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    let word1 = u32::from_be_bytes([digest[4], digest[5], digest[6], digest[7]]);
    u64::from(word0) | (u64::from(word1) << 32)
}

/// Depth-first compiler filling a pre-sized arena.
///
/// The partial-id resolver maps `(external signal id, field path)` pairs to
/// internal signal ids; the campaign manager supplies it so identical pairs
/// reuse their minted id.
pub struct ExpressionCompiler<'a> {
    arena: ExpressionArena,
    capacity: usize,
    campaign_sync_id: String,
    invocation_counter: u32,
    resolve_partial: &'a mut dyn FnMut(SignalId, &SignalPath) -> SignalId,
}

impl<'a> ExpressionCompiler<'a> {
    pub fn new(
        capacity: u32,
        campaign_sync_id: impl Into<String>,
        resolve_partial: &'a mut dyn FnMut(SignalId, &SignalPath) -> SignalId,
    ) -> Self {
        Self {
            arena: ExpressionArena {
                nodes: Vec::with_capacity(capacity as usize),
            },
            capacity: capacity as usize,
            campaign_sync_id: campaign_sync_id.into(),
            invocation_counter: 0,
            resolve_partial,
        }
    }

    /// Compile one tree into the shared arena. Returns the root index, or
    /// `None` when the tree is invalid or exceeds the depth limit.
    pub fn compile(&mut self, node: &ConditionNodeDescription) -> Option<NodeIdx> {
        self.serialize_node(node, MAX_EQUATION_DEPTH)
    }

    /// Freeze and hand out the arena.
    pub fn finish(self) -> ExpressionArena {
        self.arena
    }

    fn push_placeholder(&mut self) -> NodeIdx {
        crate::fatal_assert!(
            self.arena.nodes.len() < self.capacity,
            "expression arena would grow past its computed capacity"
        );
        self.arena.nodes.push(ExpressionNode::Bool(false));
        NodeIdx((self.arena.nodes.len() - 1) as u32)
    }

    fn serialize_node(
        &mut self,
        node: &ConditionNodeDescription,
        remaining_depth: u32,
    ) -> Option<NodeIdx> {
        if remaining_depth == 0 {
            return None;
        }
        let current = self.push_placeholder();

        let built = match node {
            ConditionNodeDescription::Signal { signal_id } => {
                trace!(signal_id, "Creating signal node");
                Some(ExpressionNode::Signal(*signal_id))
            }
            ConditionNodeDescription::Double { value } => Some(ExpressionNode::Float(*value)),
            ConditionNodeDescription::Bool { value } => Some(ExpressionNode::Bool(*value)),
            ConditionNodeDescription::String { value } => {
                Some(ExpressionNode::StringLiteral(value.clone()))
            }
            ConditionNodeDescription::PrimitiveTypeInSignal {
                signal_id,
                signal_path,
            } => {
                let resolved = if signal_path.is_empty() {
                    *signal_id
                } else {
                    (self.resolve_partial)(*signal_id, signal_path)
                };
                trace!(
                    external_id = signal_id,
                    internal_id = resolved,
                    path_len = signal_path.len(),
                    "Creating signal node for nested primitive"
                );
                Some(ExpressionNode::Signal(resolved))
            }
            ConditionNodeDescription::WindowFunction {
                signal_id,
                signal_path,
                window_type,
            } => {
                let resolved = if signal_path.is_empty() {
                    *signal_id
                } else {
                    (self.resolve_partial)(*signal_id, signal_path)
                };
                Some(ExpressionNode::WindowFunction {
                    signal_id: resolved,
                    function: WindowFunction::from(*window_type),
                })
            }
            ConditionNodeDescription::CustomFunction {
                function_name,
                params,
            } => self.serialize_custom_function(function_name, params, remaining_depth),
            ConditionNodeDescription::IsNull { expression } => match expression {
                Some(expression) => self
                    .serialize_node(expression, remaining_depth - 1)
                    .map(|child| ExpressionNode::IsNull { expression: child }),
                None => {
                    warn!("Invalid is-null node without expression");
                    None
                }
            },
            ConditionNodeDescription::Operator { op, left, right } => {
                self.serialize_operator(*op, left.as_deref(), right.as_deref(), remaining_depth)
            }
        };

        match built {
            Some(built) => {
                self.arena.nodes[current.0 as usize] = built;
                Some(current)
            }
            None => {
                // Roll back this node's slot; an invalid child has already
                // rolled back its own.
                self.arena.nodes.pop();
                None
            }
        }
    }

    fn serialize_custom_function(
        &mut self,
        function_name: &str,
        params: &[ConditionNodeDescription],
        remaining_depth: u32,
    ) -> Option<ExpressionNode> {
        let invocation = invocation_id(&self.campaign_sync_id, self.invocation_counter);
        let invocation_hex = format!("{invocation:016x}");
        trace!(
            function = function_name,
            invocation_id = %invocation_hex,
            index = self.invocation_counter,
            "Creating custom function node"
        );
        self.invocation_counter += 1;

        let mut compiled_params = Vec::with_capacity(params.len());
        for (index, param) in params.iter().enumerate() {
            match self.serialize_node(param, remaining_depth - 1) {
                Some(idx) => compiled_params.push(idx),
                None => {
                    warn!(
                        function = function_name,
                        param = index,
                        "Invalid custom function parameter, dropping node"
                    );
                    return None;
                }
            }
        }

        Some(ExpressionNode::CustomFunction {
            name: function_name.to_string(),
            invocation_id: invocation,
            params: compiled_params,
        })
    }

    fn serialize_operator(
        &mut self,
        op: OperatorDescription,
        left: Option<&ConditionNodeDescription>,
        right: Option<&ConditionNodeDescription>,
        remaining_depth: u32,
    ) -> Option<ExpressionNode> {
        let op = Operator::from(op);
        let Some(left) = left else {
            warn!("Invalid operator node without left child");
            return None;
        };
        let left = self.serialize_node(left, remaining_depth - 1)?;

        // NOT is unary and only has a left child.
        let right = if op == Operator::LogicalNot {
            None
        } else {
            match right {
                Some(right) => Some(self.serialize_node(right, remaining_depth - 1)?),
                None => {
                    warn!("Invalid binary operator node without right child");
                    return None;
                }
            }
        };

        Some(ExpressionNode::Operator { op, left, right })
    }
}
