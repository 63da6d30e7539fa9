use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumDiscriminants, EnumIter};

use crate::{quant::QuantKind, state::BufferId, weights::WeightRole};

/// How the two halves of a rotation pair are laid out inside a head
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum RopePairing {
    /// Dimensions `2i` and `2i + 1`
    Adjacent,
    /// Dimensions `i` and `i + head_size / 2`
    HalfOffset,
}

/// The operation a stage performs, with the sizes it needs.
///
/// Bindings are positional. The comment on each variant lists them in order.
#[derive(Debug, Clone, PartialEq, EnumDiscriminants, Serialize, Deserialize)]
#[strum_discriminants(name(StageOp))]
#[strum_discriminants(derive(Hash, PartialOrd, Ord, Display, EnumIter, Serialize, Deserialize))]
pub enum StageKind {
    /// `[embedding, x]`
    ActivationUpdate { len: usize },
    /// `[src, scratch]`, stores `1 / sqrt(mean(src^2) + eps)` in the scratch slot
    RmsReduce { len: usize, eps: f32 },
    /// `[src, scratch, weight, dst]`
    RmsApply { len: usize },
    /// `[x, weight, out]`
    MatVec {
        rows: usize,
        cols: usize,
        quant: QuantKind,
    },
    /// `[x, weight, acc]`, `acc += weight * x`
    MatVecResidual {
        rows: usize,
        cols: usize,
        quant: QuantKind,
    },
    /// `[bias, target]`
    BiasAdd { len: usize },
    /// `[qkv, q, k, v]`
    SplitQkv { q_dim: usize, kv_dim: usize },
    /// `[src, scratch]`, one inverse RMS per head
    HeadRmsReduce { heads: usize, head_size: usize, eps: f32 },
    /// `[scratch, weight, target]`, the weight is shared by every head
    HeadRmsApply { heads: usize, head_size: usize },
    /// `[position, q, k]`
    Rope {
        pairing: RopePairing,
        n_heads: usize,
        n_kv_heads: usize,
        head_size: usize,
        theta: f32,
    },
    /// `[position, q, k, v, key_cache, value_cache]`
    RopeCacheWrite {
        pairing: RopePairing,
        n_heads: usize,
        n_kv_heads: usize,
        head_size: usize,
        theta: f32,
        layer: usize,
    },
    /// `[position, k, v, key_cache, value_cache]`
    CacheWrite { layer: usize, kv_dim: usize },
    /// `[position, q, key_cache, value_cache, att, out]`
    Attention {
        layer: usize,
        n_heads: usize,
        n_kv_heads: usize,
        head_size: usize,
    },
    /// `[x, gate_weight, up_weight, hidden]`, `silu(gate * x) * (up * x)` in one pass
    GateUpSilu {
        hidden: usize,
        cols: usize,
        quant: QuantKind,
    },
    /// `[gate_up, hidden]`, the first half is the gate
    SplitGateUpSilu { hidden: usize },
    /// `[x, weight, logits]`
    VocabProjection {
        rows: usize,
        cols: usize,
        quant: QuantKind,
    },
}

impl StageKind {
    pub fn op(&self) -> StageOp {
        self.into()
    }

    /// Number of independent outputs the stage produces, before any per-output group width
    pub fn extent(&self) -> usize {
        match *self {
            Self::ActivationUpdate { len }
            | Self::RmsReduce { len, .. }
            | Self::RmsApply { len }
            | Self::BiasAdd { len } => len,
            Self::MatVec { rows, .. }
            | Self::MatVecResidual { rows, .. }
            | Self::VocabProjection { rows, .. } => rows,
            Self::SplitQkv { q_dim, kv_dim } => q_dim + 2 * kv_dim,
            Self::HeadRmsReduce {
                heads, head_size, ..
            }
            | Self::HeadRmsApply { heads, head_size } => heads * head_size,
            Self::Rope {
                n_heads, head_size, ..
            }
            | Self::RopeCacheWrite {
                n_heads, head_size, ..
            } => n_heads * head_size / 2,
            Self::CacheWrite { kv_dim, .. } => kv_dim,
            Self::Attention { n_heads, .. } => n_heads,
            Self::GateUpSilu { hidden, .. } | Self::SplitGateUpSilu { hidden } => hidden,
        }
    }

    /// `(heads, head_size)` for stages organised around attention heads
    pub fn heads(&self) -> Option<(usize, usize)> {
        match *self {
            Self::HeadRmsReduce {
                heads, head_size, ..
            }
            | Self::HeadRmsApply { heads, head_size } => Some((heads, head_size)),
            Self::Rope {
                n_heads, head_size, ..
            }
            | Self::RopeCacheWrite {
                n_heads, head_size, ..
            }
            | Self::Attention {
                n_heads, head_size, ..
            } => Some((n_heads, head_size)),
            _ => None,
        }
    }
}

/// How a stage touches a bound buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum Access {
    In,
    Out,
    InOut,
}

impl Access {
    pub fn reads(&self) -> bool {
        matches!(self, Self::In | Self::InOut)
    }

    pub fn writes(&self) -> bool {
        matches!(self, Self::Out | Self::InOut)
    }
}

/// A device buffer: either runtime state or a weight tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BufferRef {
    State(BufferId),
    Weight {
        role: WeightRole,
        /// `None` for model-wide weights
        layer: Option<usize>,
    },
}

impl BufferRef {
    pub fn weight(role: WeightRole, layer: usize) -> Self {
        Self::Weight {
            role,
            layer: (!role.is_global()).then_some(layer),
        }
    }

    pub fn global(role: WeightRole) -> Self {
        Self::Weight { role, layer: None }
    }

    pub fn is_weight(&self) -> bool {
        matches!(self, Self::Weight { .. })
    }
}

impl From<BufferId> for BufferRef {
    fn from(id: BufferId) -> Self {
        Self::State(id)
    }
}

impl fmt::Display for BufferRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::State(id) => write!(f, "{id}"),
            Self::Weight {
                role,
                layer: Some(l),
            } => write!(f, "{role}[{l}]"),
            Self::Weight { role, layer: None } => write!(f, "{role}"),
        }
    }
}

/// When a buffer is moved to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum Transfer {
    /// Upload on the first execution only
    AllocateOnce,
    /// Upload before every execution
    RefreshEveryStep,
    /// Already resident, nothing to move
    CarryFromPreviousStage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub buffer: BufferRef,
    pub access: Access,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDirective {
    pub buffer: BufferRef,
    pub transfer: Transfer,
}

/// Global and local work extents of a stage. One dimensional partitions keep `1` on the second
/// axis. The global extent is always a multiple of the local extent; stages bounds-check the
/// padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkPartition {
    pub global: [usize; 2],
    pub local: [usize; 2],
    pub dims: u8,
}

impl WorkPartition {
    /// Cover `extent` work items with groups of `local`
    pub fn one_d(extent: usize, local: usize) -> Self {
        let local = local.max(1);
        Self {
            global: [round_up(extent.max(1), local), 1],
            local: [local, 1],
            dims: 1,
        }
    }

    pub fn two_d(extent: [usize; 2], local: [usize; 2]) -> Self {
        let local = [local[0].max(1), local[1].max(1)];
        Self {
            global: [
                round_up(extent[0].max(1), local[0]),
                round_up(extent[1].max(1), local[1]),
            ],
            local,
            dims: 2,
        }
    }

    pub fn groups(&self) -> [usize; 2] {
        [self.global[0] / self.local[0], self.global[1] / self.local[1]]
    }

    pub fn total_work_items(&self) -> usize {
        self.global[0] * self.global[1]
    }

    /// Whether every one of `extent` work items gets a slot
    pub fn covers(&self, extent: usize) -> bool {
        self.total_work_items() >= extent
    }
}

impl fmt::Display for WorkPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dims == 1 {
            write!(f, "{}/{}", self.global[0], self.local[0])
        } else {
            write!(
                f,
                "{}x{}/{}x{}",
                self.global[0], self.global[1], self.local[0], self.local[1]
            )
        }
    }
}

fn round_up(n: usize, multiple: usize) -> usize {
    n.div_ceil(multiple) * multiple
}

/// One scheduled unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    pub name: String,
    pub kind: StageKind,
    pub bindings: Vec<Binding>,
    /// Residency directives issued before this stage runs
    pub transfers: Vec<TransferDirective>,
    /// Filled in by the partition planner
    pub partition: Option<WorkPartition>,
}

impl StageDescriptor {
    pub fn new(name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            kind,
            bindings: vec![],
            transfers: vec![],
            partition: None,
        }
    }

    pub fn bind(mut self, buffer: impl Into<BufferRef>, access: Access) -> Self {
        self.bindings.push(Binding {
            buffer: buffer.into(),
            access,
        });
        self
    }

    pub fn input(self, buffer: impl Into<BufferRef>) -> Self {
        self.bind(buffer, Access::In)
    }

    pub fn output(self, buffer: impl Into<BufferRef>) -> Self {
        self.bind(buffer, Access::Out)
    }

    pub fn in_out(self, buffer: impl Into<BufferRef>) -> Self {
        self.bind(buffer, Access::InOut)
    }

    /// Buffer of the `i`th binding
    pub fn binding(&self, i: usize) -> Option<BufferRef> {
        self.bindings.get(i).map(|b| b.buffer)
    }

    pub fn reads(&self) -> impl Iterator<Item = BufferRef> + '_ {
        self.bindings
            .iter()
            .filter(|b| b.access.reads())
            .map(|b| b.buffer)
    }

    pub fn writes(&self) -> impl Iterator<Item = BufferRef> + '_ {
        self.bindings
            .iter()
            .filter(|b| b.access.writes())
            .map(|b| b.buffer)
    }

    pub fn transfer_of(&self, buffer: BufferRef) -> Option<Transfer> {
        self.transfers
            .iter()
            .find(|t| t.buffer == buffer)
            .map(|t| t.transfer)
    }
}
