//! Patterns, replacements, and the pattern registry.
//!
//! A [`Pattern`] describes a chain of tensor-manipulation operators in
//! data-flow order (producer first). A [`Replacement`] describes, in the
//! same order, the operators to construct in a matched chain's place. The
//! [`PatternRegistry`] is an ordered list of `(Pattern, Replacement)`
//! entries; several entries may share one pattern, in which case they are
//! shape-specialized variants disambiguated by the matched chain's terminal
//! output shape.

use std::sync::LazyLock;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tgc_graph::{Attr, Op, Shape};

/// The closed set of tensor-manipulation operators patterns can name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TmOp {
    /// Reshape to a target shape.
    Reshape,
    /// Swap two axes.
    Transpose,
}

impl TmOp {
    /// Returns the operator name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Reshape => "reshape",
            Self::Transpose => "transpose",
        }
    }

    /// Classifies a graph operator, if it is in the TM set.
    #[must_use]
    pub fn of(op: &Op) -> Option<Self> {
        match op {
            Op::Reshape { .. } => Some(Self::Reshape),
            Op::Transpose { .. } => Some(Self::Transpose),
            Op::Other { .. } => None,
        }
    }
}

/// One position of a pattern or replacement chain.
///
/// On the pattern side, `strict` governs matching: a strict signature
/// requires element-wise attribute equality against the graph node's
/// normalized attribute view, a non-strict signature matches on operator
/// kind alone. On the replacement side `strict` is meaningless; replacement
/// signatures are constructed verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpSignature {
    /// The operator kind.
    pub op: TmOp,
    /// Ordered attribute list (axis indices for transpose, target
    /// dimensions for reshape).
    pub attrs: SmallVec<[Attr; 2]>,
    /// Whether matching compares attributes.
    pub strict: bool,
}

impl OpSignature {
    /// A wildcard reshape: matches any reshape regardless of target shape.
    #[must_use]
    pub fn reshape() -> Self {
        Self {
            op: TmOp::Reshape,
            attrs: SmallVec::new(),
            strict: false,
        }
    }

    /// A reshape with a concrete target shape (replacement side).
    #[must_use]
    pub fn reshape_to(dims: impl IntoIterator<Item = i64>) -> Self {
        Self {
            op: TmOp::Reshape,
            attrs: dims.into_iter().map(Attr::Int).collect(),
            strict: false,
        }
    }

    /// A transpose of two axes, matched strictly.
    #[must_use]
    pub fn transpose(dim0: i64, dim1: i64) -> Self {
        Self {
            op: TmOp::Transpose,
            attrs: SmallVec::from_iter([Attr::Int(dim0), Attr::Int(dim1)]),
            strict: true,
        }
    }

    /// Tests this pattern-side signature against a graph operator.
    ///
    /// The pattern side is authoritative: the graph node's attributes are
    /// only data to compare against, and are ignored entirely when this
    /// signature is non-strict.
    #[must_use]
    pub fn matches(&self, op: &Op) -> bool {
        let Some(kind) = TmOp::of(op) else {
            return false;
        };
        if kind != self.op {
            return false;
        }
        !self.strict || op.attrs().as_slice() == self.attrs.as_slice()
    }

    /// Returns the concrete reshape target shape, if this signature is a
    /// reshape carrying one.
    #[must_use]
    pub fn target_shape(&self) -> Option<Shape> {
        if self.op != TmOp::Reshape || self.attrs.is_empty() {
            return None;
        }
        let dims: Option<SmallVec<[i64; 4]>> = self.attrs.iter().map(Attr::as_int).collect();
        dims.map(Shape::new)
    }

    /// Returns the two transpose axes, if this signature is a transpose
    /// carrying exactly two integer attributes.
    #[must_use]
    pub fn transpose_axes(&self) -> Option<(i64, i64)> {
        if self.op != TmOp::Transpose {
            return None;
        }
        match self.attrs.as_slice() {
            [Attr::Int(d0), Attr::Int(d1)] => Some((*d0, *d1)),
            _ => None,
        }
    }

    /// Tests this pattern-side signature against a replacement-side one,
    /// treating the replacement's attributes as node data.
    fn matches_signature(&self, other: &Self) -> bool {
        self.op == other.op && (!self.strict || self.attrs == other.attrs)
    }
}

/// An ordered chain of signatures to match, in data-flow order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pattern(Vec<OpSignature>);

impl Pattern {
    /// Creates a pattern from signatures in data-flow order.
    #[must_use]
    pub fn new(sigs: impl IntoIterator<Item = OpSignature>) -> Self {
        Self(sigs.into_iter().collect())
    }

    /// Returns the signatures.
    #[must_use]
    pub fn sigs(&self) -> &[OpSignature] {
        &self.0
    }

    /// Returns the chain length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the pattern has no signatures.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// An ordered chain of signatures to construct, in data-flow order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Replacement(Vec<OpSignature>);

impl Replacement {
    /// Creates a replacement from signatures in data-flow order.
    #[must_use]
    pub fn new(sigs: impl IntoIterator<Item = OpSignature>) -> Self {
        Self(sigs.into_iter().collect())
    }

    /// Returns the signatures.
    #[must_use]
    pub fn sigs(&self) -> &[OpSignature] {
        &self.0
    }

    /// Returns the chain length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the replacement has no signatures.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the final signature's concrete reshape target shape, if any.
    #[must_use]
    pub fn terminal_shape(&self) -> Option<Shape> {
        self.0.last().and_then(OpSignature::target_shape)
    }
}

/// Errors detected while constructing a [`PatternRegistry`].
///
/// These are configuration errors in the rule table itself, surfaced at
/// registry construction rather than per match.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// An entry's pattern has no signatures.
    #[error("entry {entry}: pattern is empty")]
    EmptyPattern {
        /// Zero-based entry index.
        entry: usize,
    },

    /// An entry's replacement has no signatures.
    #[error("entry {entry}: replacement is empty")]
    EmptyReplacement {
        /// Zero-based entry index.
        entry: usize,
    },

    /// A transpose signature does not carry exactly two integer axes.
    #[error("entry {entry}: transpose signature must carry exactly two integer axes")]
    MalformedTranspose {
        /// Zero-based entry index.
        entry: usize,
    },

    /// A replacement-side reshape lacks a concrete target shape.
    #[error("entry {entry}: replacement reshape lacks a concrete target shape")]
    MalformedReshape {
        /// Zero-based entry index.
        entry: usize,
    },

    /// A pattern has several replacement candidates, but one of them cannot
    /// be disambiguated by terminal shape.
    #[error(
        "entry {entry}: pattern has multiple replacement candidates but this one's \
         final signature has no concrete shape to select on"
    )]
    AmbiguousVariant {
        /// Zero-based entry index.
        entry: usize,
    },

    /// A replacement chain would itself match a registered pattern, which
    /// makes the fixed-point driver loop forever.
    #[error("entry {entry}: replacement chain re-matches a registered pattern")]
    ReplacementRematches {
        /// Zero-based entry index.
        entry: usize,
    },
}

/// An ordered, immutable table of `(Pattern, Replacement)` fusion rules.
///
/// Entries sharing a structurally equal pattern are grouped; within a
/// group, registration order is the tie-break order for shape-specialized
/// variant selection.
#[derive(Clone, Debug)]
pub struct PatternRegistry {
    groups: Vec<(Pattern, Vec<Replacement>)>,
    entries: usize,
}

impl PatternRegistry {
    /// Builds a registry from rule entries, validating the whole table.
    ///
    /// # Errors
    ///
    /// Returns the first [`RegistryError`] found. A registry that fails to
    /// build must be treated as a fatal configuration error by the caller.
    pub fn new(
        entries: impl IntoIterator<Item = (Pattern, Replacement)>,
    ) -> Result<Self, RegistryError> {
        let entries: Vec<(Pattern, Replacement)> = entries.into_iter().collect();

        for (i, (pattern, replacement)) in entries.iter().enumerate() {
            if pattern.is_empty() {
                return Err(RegistryError::EmptyPattern { entry: i });
            }
            if replacement.is_empty() {
                return Err(RegistryError::EmptyReplacement { entry: i });
            }
            for sig in pattern.sigs() {
                if sig.op == TmOp::Transpose && sig.strict && sig.transpose_axes().is_none() {
                    return Err(RegistryError::MalformedTranspose { entry: i });
                }
            }
            for sig in replacement.sigs() {
                match sig.op {
                    TmOp::Transpose if sig.transpose_axes().is_none() => {
                        return Err(RegistryError::MalformedTranspose { entry: i });
                    }
                    TmOp::Reshape if sig.target_shape().is_none() => {
                        return Err(RegistryError::MalformedReshape { entry: i });
                    }
                    _ => {}
                }
            }
        }

        // Group by structural pattern equality, preserving first-seen order.
        let mut groups: Vec<(Pattern, Vec<Replacement>)> = Vec::new();
        let mut by_pattern: FxHashMap<Pattern, usize> = FxHashMap::default();
        for (pattern, replacement) in &entries {
            let slot = *by_pattern.entry(pattern.clone()).or_insert_with(|| {
                groups.push((pattern.clone(), Vec::new()));
                groups.len() - 1
            });
            groups[slot].1.push(replacement.clone());
        }

        // Shape-specialized variants can only be told apart by a concrete
        // terminal reshape shape.
        for (i, (pattern, replacement)) in entries.iter().enumerate() {
            let group = &groups[by_pattern[pattern]];
            if group.1.len() > 1 && replacement.terminal_shape().is_none() {
                return Err(RegistryError::AmbiguousVariant { entry: i });
            }
        }

        // A replacement that re-matches any registered pattern would be
        // rewritten again on the next scan, forever.
        for (i, (_, replacement)) in entries.iter().enumerate() {
            for (pattern, _) in &groups {
                if replacement_rematches(replacement, pattern) {
                    return Err(RegistryError::ReplacementRematches { entry: i });
                }
            }
        }

        Ok(Self {
            groups,
            entries: entries.len(),
        })
    }

    /// Returns the pattern groups in first-registration order. Within each
    /// group, replacements keep their registration order.
    #[must_use]
    pub fn groups(&self) -> &[(Pattern, Vec<Replacement>)] {
        &self.groups
    }

    /// Returns the total number of registered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
    }

    /// Returns true if no entries are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }
}

/// True if any window of `replacement` would match `pattern` in full.
fn replacement_rematches(replacement: &Replacement, pattern: &Pattern) -> bool {
    let sigs = replacement.sigs();
    if sigs.len() < pattern.len() {
        return false;
    }
    sigs.windows(pattern.len()).any(|window| {
        window
            .iter()
            .zip(pattern.sigs())
            .all(|(built, pat)| pat.matches_signature(built))
    })
}

static BUILTIN: LazyLock<PatternRegistry> = LazyLock::new(|| {
    PatternRegistry::new(builtin_entries()).expect("built-in TM fusion table is well-formed")
});

/// Returns the built-in fusion rule table.
///
/// The table is constructed once per process. A malformed built-in table is
/// a programming error and aborts on first use.
#[must_use]
pub fn builtin_registry() -> &'static PatternRegistry {
    &BUILTIN
}

/// The built-in rule entries.
///
/// The shape-specialized reshape variants are a closed-world table keyed to
/// the anchor-grid output shapes of known detection networks; chains ending
/// in any other shape are deliberately left unfused.
fn builtin_entries() -> Vec<(Pattern, Replacement)> {
    let mut entries = Vec::new();

    // reshape . transpose(-3,-1) . transpose(-2,-1) . reshape
    // collapses to a single transpose of the last two axes.
    let double_transpose = Pattern::new([
        OpSignature::reshape(),
        OpSignature::transpose(-3, -1),
        OpSignature::transpose(-2, -1),
        OpSignature::reshape(),
    ]);
    entries.push((
        double_transpose,
        Replacement::new([OpSignature::transpose(-2, -1)]),
    ));

    // transpose(-2,-1) . reshape . transpose(-3,-2) . transpose(-2,-1)
    // . reshape collapses to one reshape, for known head shapes.
    let head_flatten = Pattern::new([
        OpSignature::transpose(-2, -1),
        OpSignature::reshape(),
        OpSignature::transpose(-3, -2),
        OpSignature::transpose(-2, -1),
        OpSignature::reshape(),
    ]);
    const HEAD_FLATTEN_SHAPES: [[i64; 3]; 16] = [
        [1, 2166, 21],
        [1, 600, 21],
        [1, 150, 21],
        [1, 54, 21],
        [1, 24, 21],
        [1, 6, 21],
        [1, 2166, 4],
        [1, 600, 4],
        [1, 150, 4],
        [1, 54, 4],
        [1, 24, 4],
        [1, 6, 4],
        [1, 384, 12],
        [1, 512, 12],
        [1, 384, 1],
        [1, 512, 1],
    ];
    for dims in HEAD_FLATTEN_SHAPES {
        entries.push((
            head_flatten.clone(),
            Replacement::new([OpSignature::reshape_to(dims)]),
        ));
    }

    // transpose(-2,-1) . reshape . transpose(-4,-2) . transpose(-3,-1)
    // . reshape, same idea with a deeper interleave.
    let grid_flatten = Pattern::new([
        OpSignature::transpose(-2, -1),
        OpSignature::reshape(),
        OpSignature::transpose(-4, -2),
        OpSignature::transpose(-3, -1),
        OpSignature::reshape(),
    ]);
    const GRID_FLATTEN_SHAPES: [[i64; 3]; 10] = [
        [1, 90000, 91],
        [1, 22500, 91],
        [1, 5625, 91],
        [1, 1521, 91],
        [1, 441, 91],
        [1, 90000, 4],
        [1, 22500, 4],
        [1, 5625, 4],
        [1, 1521, 4],
        [1, 441, 4],
    ];
    for dims in GRID_FLATTEN_SHAPES {
        entries.push((
            grid_flatten.clone(),
            Replacement::new([OpSignature::reshape_to(dims)]),
        ));
    }

    entries
}
