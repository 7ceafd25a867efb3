//! The node record and the closed set of node kinds.
//!
//! Every program, datum, and stack in the engine is made of these nodes.
//! A node's kind determines whether it stores ordered or mapped children;
//! leaf kinds carry a scalar payload instead. The kind set is closed and is
//! dispatched through dense `match` tables, never through trait objects.

use std::collections::HashMap;

use crate::intern::{self, SymbolId};

/// Arena index of a node within one [`crate::NodeManager`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    #[inline(always)]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

// ---------------------------------------------------------------------------
// NodeKind
// ---------------------------------------------------------------------------

/// Every opcode and value kind in the engine, grouped by family.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    // -- system --
    System,
    GetDefaults,
    Parse,
    Unparse,

    // -- control --
    If,
    Seq,
    Parallel,
    Lambda,
    Conclude,
    Return,
    Call,
    CallSandboxed,
    While,

    // -- definitions --
    Let,
    Declare,
    Assign,
    Accum,

    // -- retrieval --
    Retrieve,
    Get,
    Set,
    Replace,

    // -- stack introspection --
    Target,
    CurrentIndex,
    CurrentValue,
    PreviousResult,
    OpcodeStack,
    Stack,
    Args,

    // -- simulation --
    Rand,
    WeightedRand,
    GetRandSeed,
    SetRandSeed,
    SystemTime,

    // -- base math --
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulus,
    GetDigits,
    SetDigits,
    Floor,
    Ceiling,
    Round,

    // -- extended math --
    Exponent,
    Log,
    Sin,
    Asin,
    Cos,
    Acos,
    Tan,
    Atan,
    Sinh,
    Asinh,
    Cosh,
    Acosh,
    Tanh,
    Atanh,
    Erf,
    Tgamma,
    Lgamma,
    Sqrt,
    Pow,
    Abs,
    Max,
    Min,
    DotProduct,
    GeneralizedDistance,
    Entropy,

    // -- list manipulation --
    First,
    Tail,
    Last,
    Trunc,
    Append,
    Size,
    Range,

    // -- transformation --
    Rewrite,
    Map,
    Filter,
    Weave,
    Reduce,
    Apply,
    Reverse,
    Sort,

    // -- associative manipulation --
    Indices,
    Values,
    ContainsIndex,
    ContainsValue,
    Remove,
    Keep,
    Associate,
    Zip,
    Unzip,

    // -- logic --
    And,
    Or,
    Xor,
    Not,

    // -- equivalence --
    Equal,
    Nequal,
    Less,
    Lequal,
    Greater,
    Gequal,
    TypeEquals,
    TypeNequals,

    // -- constants --
    True,
    False,
    Null,

    // -- data types --
    List,
    Assoc,
    Number,
    String,
    Symbol,

    // -- node types --
    GetType,
    GetTypeString,
    SetType,
    Format,

    // -- labels, comments, concurrency --
    GetLabels,
    GetAllLabels,
    SetLabels,
    ZipLabels,
    GetComments,
    SetComments,
    GetConcurrency,
    SetConcurrency,
    GetValue,
    SetValue,

    // -- string --
    Explode,
    Split,
    Substr,
    Concat,

    // -- encryption --
    CryptoSign,
    CryptoSignVerify,
    Encrypt,
    Decrypt,

    // -- i/o --
    Print,

    // -- tree merging --
    TotalSize,
    Mutate,
    Commonality,
    EditDistance,
    Intersect,
    Union,
    Difference,
    Mix,
    MixLabels,

    // -- entity merging --
    TotalEntitySize,
    FlattenEntity,
    MutateEntity,
    CommonalityEntities,
    EditDistanceEntities,
    IntersectEntities,
    UnionEntities,
    DifferenceEntities,
    MixEntities,

    // -- entity details --
    GetEntityComments,
    RetrieveEntityRoot,
    AssignEntityRoots,
    AccumEntityRoots,
    GetEntityRandSeed,
    SetEntityRandSeed,
    GetEntityRootPermission,
    SetEntityRootPermission,

    // -- entity actions --
    CreateEntities,
    CloneEntities,
    MoveEntities,
    DestroyEntities,
    Load,
    LoadEntity,
    LoadPersist,
    Store,
    StoreEntity,
    ContainsEntity,

    // -- entity queries --
    ContainedEntities,
    ComputeOnContainedEntities,
    QuerySelect,
    QuerySample,
    QueryWeightedSample,
    QueryInEntityList,
    QueryNotInEntityList,
    QueryCount,
    QueryExists,
    QueryNotExists,
    QueryEquals,
    QueryNotEquals,
    QueryBetween,
    QueryNotBetween,
    QueryAmong,
    QueryNotAmong,
    QueryMax,
    QueryMin,
    QuerySum,
    QueryMode,
    QueryQuantile,
    QueryGeneralizedMean,
    QueryMinDifference,
    QueryMaxDifference,
    QueryValueMasses,
    QueryGreaterOrEqualTo,
    QueryLessOrEqualTo,
    QueryWithinGeneralizedDistance,
    QueryNearestGeneralizedDistance,

    // -- aggregate analysis (delegated to the statistics library) --
    ComputeEntityConvictions,
    ComputeEntityGroupKlDivergence,
    ComputeEntityDistanceContributions,
    ComputeEntityKlDivergences,

    // -- entity access --
    ContainsLabel,
    AssignToEntities,
    DirectAssignToEntities,
    AccumToEntities,
    RetrieveFromEntity,
    DirectRetrieveFromEntity,
    CallEntity,
    CallEntityGetChanges,
    CallContainer,

    // -- not in active memory --
    Deallocated,
    Uninitialized,
}

impl NodeKind {
    /// Surface-syntax name of the kind.
    pub fn name(self) -> &'static str {
        use NodeKind::*;
        match self {
            System => "system",
            GetDefaults => "get_defaults",
            Parse => "parse",
            Unparse => "unparse",
            If => "if",
            Seq => "seq",
            Parallel => "parallel",
            Lambda => "lambda",
            Conclude => "conclude",
            Return => "return",
            Call => "call",
            CallSandboxed => "call_sandboxed",
            While => "while",
            Let => "let",
            Declare => "declare",
            Assign => "assign",
            Accum => "accum",
            Retrieve => "retrieve",
            Get => "get",
            Set => "set",
            Replace => "replace",
            Target => "target",
            CurrentIndex => "current_index",
            CurrentValue => "current_value",
            PreviousResult => "previous_result",
            OpcodeStack => "opcode_stack",
            Stack => "stack",
            Args => "args",
            Rand => "rand",
            WeightedRand => "weighted_rand",
            GetRandSeed => "get_rand_seed",
            SetRandSeed => "set_rand_seed",
            SystemTime => "system_time",
            Add => "+",
            Subtract => "-",
            Multiply => "*",
            Divide => "/",
            Modulus => "mod",
            GetDigits => "get_digits",
            SetDigits => "set_digits",
            Floor => "floor",
            Ceiling => "ceil",
            Round => "round",
            Exponent => "exp",
            Log => "log",
            Sin => "sin",
            Asin => "asin",
            Cos => "cos",
            Acos => "acos",
            Tan => "tan",
            Atan => "atan",
            Sinh => "sinh",
            Asinh => "asinh",
            Cosh => "cosh",
            Acosh => "acosh",
            Tanh => "tanh",
            Atanh => "atanh",
            Erf => "erf",
            Tgamma => "tgamma",
            Lgamma => "lgamma",
            Sqrt => "sqrt",
            Pow => "pow",
            Abs => "abs",
            Max => "max",
            Min => "min",
            DotProduct => "dot_product",
            GeneralizedDistance => "generalized_distance",
            Entropy => "entropy",
            First => "first",
            Tail => "tail",
            Last => "last",
            Trunc => "trunc",
            Append => "append",
            Size => "size",
            Range => "range",
            Rewrite => "rewrite",
            Map => "map",
            Filter => "filter",
            Weave => "weave",
            Reduce => "reduce",
            Apply => "apply",
            Reverse => "reverse",
            Sort => "sort",
            Indices => "indices",
            Values => "values",
            ContainsIndex => "contains_index",
            ContainsValue => "contains_value",
            Remove => "remove",
            Keep => "keep",
            Associate => "associate",
            Zip => "zip",
            Unzip => "unzip",
            And => "and",
            Or => "or",
            Xor => "xor",
            Not => "not",
            Equal => "=",
            Nequal => "!=",
            Less => "<",
            Lequal => "<=",
            Greater => ">",
            Gequal => ">=",
            TypeEquals => "~",
            TypeNequals => "!~",
            True => "true",
            False => "false",
            Null => "null",
            List => "list",
            Assoc => "assoc",
            Number => "number",
            String => "string",
            Symbol => "symbol",
            GetType => "get_type",
            GetTypeString => "get_type_string",
            SetType => "set_type",
            Format => "format",
            GetLabels => "get_labels",
            GetAllLabels => "get_all_labels",
            SetLabels => "set_labels",
            ZipLabels => "zip_labels",
            GetComments => "get_comments",
            SetComments => "set_comments",
            GetConcurrency => "get_concurrency",
            SetConcurrency => "set_concurrency",
            GetValue => "get_value",
            SetValue => "set_value",
            Explode => "explode",
            Split => "split",
            Substr => "substr",
            Concat => "concat",
            CryptoSign => "crypto_sign",
            CryptoSignVerify => "crypto_sign_verify",
            Encrypt => "encrypt",
            Decrypt => "decrypt",
            Print => "print",
            TotalSize => "total_size",
            Mutate => "mutate",
            Commonality => "commonality",
            EditDistance => "edit_distance",
            Intersect => "intersect",
            Union => "union",
            Difference => "difference",
            Mix => "mix",
            MixLabels => "mix_labels",
            TotalEntitySize => "total_entity_size",
            FlattenEntity => "flatten_entity",
            MutateEntity => "mutate_entity",
            CommonalityEntities => "commonality_entities",
            EditDistanceEntities => "edit_distance_entities",
            IntersectEntities => "intersect_entities",
            UnionEntities => "union_entities",
            DifferenceEntities => "difference_entities",
            MixEntities => "mix_entities",
            GetEntityComments => "get_entity_comments",
            RetrieveEntityRoot => "retrieve_entity_root",
            AssignEntityRoots => "assign_entity_roots",
            AccumEntityRoots => "accum_entity_roots",
            GetEntityRandSeed => "get_entity_rand_seed",
            SetEntityRandSeed => "set_entity_rand_seed",
            GetEntityRootPermission => "get_entity_root_permission",
            SetEntityRootPermission => "set_entity_root_permission",
            CreateEntities => "create_entities",
            CloneEntities => "clone_entities",
            MoveEntities => "move_entities",
            DestroyEntities => "destroy_entities",
            Load => "load",
            LoadEntity => "load_entity",
            LoadPersist => "load_persist",
            Store => "store",
            StoreEntity => "store_entity",
            ContainsEntity => "contains_entity",
            ContainedEntities => "contained_entities",
            ComputeOnContainedEntities => "compute_on_contained_entities",
            QuerySelect => "query_select",
            QuerySample => "query_sample",
            QueryWeightedSample => "query_weighted_sample",
            QueryInEntityList => "query_in_entity_list",
            QueryNotInEntityList => "query_not_in_entity_list",
            QueryCount => "query_count",
            QueryExists => "query_exists",
            QueryNotExists => "query_not_exists",
            QueryEquals => "query_equals",
            QueryNotEquals => "query_not_equals",
            QueryBetween => "query_between",
            QueryNotBetween => "query_not_between",
            QueryAmong => "query_among",
            QueryNotAmong => "query_not_among",
            QueryMax => "query_max",
            QueryMin => "query_min",
            QuerySum => "query_sum",
            QueryMode => "query_mode",
            QueryQuantile => "query_quantile",
            QueryGeneralizedMean => "query_generalized_mean",
            QueryMinDifference => "query_min_difference",
            QueryMaxDifference => "query_max_difference",
            QueryValueMasses => "query_value_masses",
            QueryGreaterOrEqualTo => "query_greater_or_equal_to",
            QueryLessOrEqualTo => "query_less_or_equal_to",
            QueryWithinGeneralizedDistance => "query_within_generalized_distance",
            QueryNearestGeneralizedDistance => "query_nearest_generalized_distance",
            ComputeEntityConvictions => "compute_entity_convictions",
            ComputeEntityGroupKlDivergence => "compute_entity_group_kl_divergence",
            ComputeEntityDistanceContributions => "compute_entity_distance_contributions",
            ComputeEntityKlDivergences => "compute_entity_kl_divergences",
            ContainsLabel => "contains_label",
            AssignToEntities => "assign_to_entities",
            DirectAssignToEntities => "direct_assign_to_entities",
            AccumToEntities => "accum_to_entities",
            RetrieveFromEntity => "retrieve_from_entity",
            DirectRetrieveFromEntity => "direct_retrieve_from_entity",
            CallEntity => "call_entity",
            CallEntityGetChanges => "call_entity_get_changes",
            CallContainer => "call_container",
            Deallocated => "deallocated",
            Uninitialized => "uninitialized",
        }
    }

    /// Parses a surface-syntax name back to a kind. The internal kinds
    /// (`deallocated`, `uninitialized`) are not parseable.
    pub fn from_name(s: &str) -> Option<NodeKind> {
        use NodeKind::*;
        let kind = match s {
            "system" => System,
            "get_defaults" => GetDefaults,
            "parse" => Parse,
            "unparse" => Unparse,
            "if" => If,
            "seq" => Seq,
            "parallel" => Parallel,
            "lambda" => Lambda,
            "conclude" => Conclude,
            "return" => Return,
            "call" => Call,
            "call_sandboxed" => CallSandboxed,
            "while" => While,
            "let" => Let,
            "declare" => Declare,
            "assign" => Assign,
            "accum" => Accum,
            "retrieve" => Retrieve,
            "get" => Get,
            "set" => Set,
            "replace" => Replace,
            "target" => Target,
            "current_index" => CurrentIndex,
            "current_value" => CurrentValue,
            "previous_result" => PreviousResult,
            "opcode_stack" => OpcodeStack,
            "stack" => Stack,
            "args" => Args,
            "rand" => Rand,
            "weighted_rand" => WeightedRand,
            "get_rand_seed" => GetRandSeed,
            "set_rand_seed" => SetRandSeed,
            "system_time" => SystemTime,
            "+" => Add,
            "-" => Subtract,
            "*" => Multiply,
            "/" => Divide,
            "mod" => Modulus,
            "get_digits" => GetDigits,
            "set_digits" => SetDigits,
            "floor" => Floor,
            "ceil" => Ceiling,
            "round" => Round,
            "exp" => Exponent,
            "log" => Log,
            "sin" => Sin,
            "asin" => Asin,
            "cos" => Cos,
            "acos" => Acos,
            "tan" => Tan,
            "atan" => Atan,
            "sinh" => Sinh,
            "asinh" => Asinh,
            "cosh" => Cosh,
            "acosh" => Acosh,
            "tanh" => Tanh,
            "atanh" => Atanh,
            "erf" => Erf,
            "tgamma" => Tgamma,
            "lgamma" => Lgamma,
            "sqrt" => Sqrt,
            "pow" => Pow,
            "abs" => Abs,
            "max" => Max,
            "min" => Min,
            "dot_product" => DotProduct,
            "generalized_distance" => GeneralizedDistance,
            "entropy" => Entropy,
            "first" => First,
            "tail" => Tail,
            "last" => Last,
            "trunc" => Trunc,
            "append" => Append,
            "size" => Size,
            "range" => Range,
            "rewrite" => Rewrite,
            "map" => Map,
            "filter" => Filter,
            "weave" => Weave,
            "reduce" => Reduce,
            "apply" => Apply,
            "reverse" => Reverse,
            "sort" => Sort,
            "indices" => Indices,
            "values" => Values,
            "contains_index" => ContainsIndex,
            "contains_value" => ContainsValue,
            "remove" => Remove,
            "keep" => Keep,
            "associate" => Associate,
            "zip" => Zip,
            "unzip" => Unzip,
            "and" => And,
            "or" => Or,
            "xor" => Xor,
            "not" => Not,
            "=" => Equal,
            "!=" => Nequal,
            "<" => Less,
            "<=" => Lequal,
            ">" => Greater,
            ">=" => Gequal,
            "~" => TypeEquals,
            "!~" => TypeNequals,
            "true" => True,
            "false" => False,
            "null" => Null,
            "list" => List,
            "assoc" => Assoc,
            "number" => Number,
            "string" => String,
            "symbol" => Symbol,
            "get_type" => GetType,
            "get_type_string" => GetTypeString,
            "set_type" => SetType,
            "format" => Format,
            "get_labels" => GetLabels,
            "get_all_labels" => GetAllLabels,
            "set_labels" => SetLabels,
            "zip_labels" => ZipLabels,
            "get_comments" => GetComments,
            "set_comments" => SetComments,
            "get_concurrency" => GetConcurrency,
            "set_concurrency" => SetConcurrency,
            "get_value" => GetValue,
            "set_value" => SetValue,
            "explode" => Explode,
            "split" => Split,
            "substr" => Substr,
            "concat" => Concat,
            "crypto_sign" => CryptoSign,
            "crypto_sign_verify" => CryptoSignVerify,
            "encrypt" => Encrypt,
            "decrypt" => Decrypt,
            "print" => Print,
            "total_size" => TotalSize,
            "mutate" => Mutate,
            "commonality" => Commonality,
            "edit_distance" => EditDistance,
            "intersect" => Intersect,
            "union" => Union,
            "difference" => Difference,
            "mix" => Mix,
            "mix_labels" => MixLabels,
            "total_entity_size" => TotalEntitySize,
            "flatten_entity" => FlattenEntity,
            "mutate_entity" => MutateEntity,
            "commonality_entities" => CommonalityEntities,
            "edit_distance_entities" => EditDistanceEntities,
            "intersect_entities" => IntersectEntities,
            "union_entities" => UnionEntities,
            "difference_entities" => DifferenceEntities,
            "mix_entities" => MixEntities,
            "get_entity_comments" => GetEntityComments,
            "retrieve_entity_root" => RetrieveEntityRoot,
            "assign_entity_roots" => AssignEntityRoots,
            "accum_entity_roots" => AccumEntityRoots,
            "get_entity_rand_seed" => GetEntityRandSeed,
            "set_entity_rand_seed" => SetEntityRandSeed,
            "get_entity_root_permission" => GetEntityRootPermission,
            "set_entity_root_permission" => SetEntityRootPermission,
            "create_entities" => CreateEntities,
            "clone_entities" => CloneEntities,
            "move_entities" => MoveEntities,
            "destroy_entities" => DestroyEntities,
            "load" => Load,
            "load_entity" => LoadEntity,
            "load_persist" => LoadPersist,
            "store" => Store,
            "store_entity" => StoreEntity,
            "contains_entity" => ContainsEntity,
            "contained_entities" => ContainedEntities,
            "compute_on_contained_entities" => ComputeOnContainedEntities,
            "query_select" => QuerySelect,
            "query_sample" => QuerySample,
            "query_weighted_sample" => QueryWeightedSample,
            "query_in_entity_list" => QueryInEntityList,
            "query_not_in_entity_list" => QueryNotInEntityList,
            "query_count" => QueryCount,
            "query_exists" => QueryExists,
            "query_not_exists" => QueryNotExists,
            "query_equals" => QueryEquals,
            "query_not_equals" => QueryNotEquals,
            "query_between" => QueryBetween,
            "query_not_between" => QueryNotBetween,
            "query_among" => QueryAmong,
            "query_not_among" => QueryNotAmong,
            "query_max" => QueryMax,
            "query_min" => QueryMin,
            "query_sum" => QuerySum,
            "query_mode" => QueryMode,
            "query_quantile" => QueryQuantile,
            "query_generalized_mean" => QueryGeneralizedMean,
            "query_min_difference" => QueryMinDifference,
            "query_max_difference" => QueryMaxDifference,
            "query_value_masses" => QueryValueMasses,
            "query_greater_or_equal_to" => QueryGreaterOrEqualTo,
            "query_less_or_equal_to" => QueryLessOrEqualTo,
            "query_within_generalized_distance" => QueryWithinGeneralizedDistance,
            "query_nearest_generalized_distance" => QueryNearestGeneralizedDistance,
            "compute_entity_convictions" => ComputeEntityConvictions,
            "compute_entity_group_kl_divergence" => ComputeEntityGroupKlDivergence,
            "compute_entity_distance_contributions" => ComputeEntityDistanceContributions,
            "compute_entity_kl_divergences" => ComputeEntityKlDivergences,
            "contains_label" => ContainsLabel,
            "assign_to_entities" => AssignToEntities,
            "direct_assign_to_entities" => DirectAssignToEntities,
            "accum_to_entities" => AccumToEntities,
            "retrieve_from_entity" => RetrieveFromEntity,
            "direct_retrieve_from_entity" => DirectRetrieveFromEntity,
            "call_entity" => CallEntity,
            "call_entity_get_changes" => CallEntityGetChanges,
            "call_container" => CallContainer,
            _ => return None,
        };
        Some(kind)
    }

    /// True for kinds whose payload is a scalar (or nothing) rather than
    /// child nodes.
    #[inline]
    pub fn is_immediate(self) -> bool {
        matches!(
            self,
            NodeKind::Number
                | NodeKind::String
                | NodeKind::Symbol
                | NodeKind::True
                | NodeKind::False
                | NodeKind::Null
        )
    }

    /// True for kinds that store mapped (key -> node) children.
    #[inline]
    pub fn uses_mapped_children(self) -> bool {
        self == NodeKind::Assoc
    }

    /// True for kinds that store ordered children.
    #[inline]
    pub fn uses_ordered_children(self) -> bool {
        !self.is_immediate() && !self.uses_mapped_children()
    }

    /// True for kinds that carry an interned-string payload.
    #[inline]
    pub fn uses_string_payload(self) -> bool {
        matches!(self, NodeKind::String | NodeKind::Symbol)
    }

    /// Kinds whose evaluation can never have side effects when all their
    /// descendants are also idempotent. Used to seed the per-node
    /// `idempotent` flag at parse time.
    pub fn is_potentially_idempotent(self) -> bool {
        use NodeKind::*;
        matches!(
            self,
            Number | String | True | False | Null | List | Assoc | Lambda
        )
    }

    /// Entity queries build condition records instead of evaluating eagerly.
    #[inline]
    pub fn is_query(self) -> bool {
        use NodeKind::*;
        matches!(
            self,
            QuerySelect
                | QuerySample
                | QueryWeightedSample
                | QueryInEntityList
                | QueryNotInEntityList
                | QueryCount
                | QueryExists
                | QueryNotExists
                | QueryEquals
                | QueryNotEquals
                | QueryBetween
                | QueryNotBetween
                | QueryAmong
                | QueryNotAmong
                | QueryMax
                | QueryMin
                | QuerySum
                | QueryMode
                | QueryQuantile
                | QueryGeneralizedMean
                | QueryMinDifference
                | QueryMaxDifference
                | QueryValueMasses
                | QueryGreaterOrEqualTo
                | QueryLessOrEqualTo
                | QueryWithinGeneralizedDistance
                | QueryNearestGeneralizedDistance
        )
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Label sigil marking a label as private to its entity.
pub const PRIVATE_LABEL_SIGIL: char = '!';

pub(crate) const FLAG_NEED_CYCLE_CHECK: u8 = 1 << 0;
pub(crate) const FLAG_IDEMPOTENT: u8 = 1 << 1;
pub(crate) const FLAG_CONCURRENCY: u8 = 1 << 2;
pub(crate) const FLAG_MARKED: u8 = 1 << 3;

/// A tagged graph node. Exactly one of `ordered` / `mapped` is populated for
/// composite kinds; leaf kinds use `number` or `symbol`.
#[derive(Debug)]
pub struct Node {
    pub(crate) kind: NodeKind,
    pub(crate) number: f64,
    /// String payload for `String`/`Symbol` kinds; owns one pool reference.
    pub(crate) symbol: SymbolId,
    pub(crate) ordered: Vec<NodeId>,
    /// Keys own one pool reference each.
    pub(crate) mapped: HashMap<SymbolId, NodeId>,
    /// Each label owns one pool reference.
    pub(crate) labels: Vec<SymbolId>,
    /// Comment text; owns one pool reference. First line carries the source
    /// location when debug sources are enabled.
    pub(crate) comment: SymbolId,
    pub(crate) flags: u8,
}

impl Node {
    pub(crate) fn new(kind: NodeKind) -> Node {
        Node {
            kind,
            number: 0.0,
            symbol: SymbolId::NONE,
            ordered: Vec::new(),
            mapped: HashMap::new(),
            labels: Vec::new(),
            comment: SymbolId::NONE,
            flags: 0,
        }
    }

    #[inline(always)]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    #[inline(always)]
    pub fn need_cycle_check(&self) -> bool {
        self.flags & FLAG_NEED_CYCLE_CHECK != 0
    }

    #[inline(always)]
    pub fn is_idempotent(&self) -> bool {
        self.flags & FLAG_IDEMPOTENT != 0
    }

    #[inline(always)]
    pub fn concurrency_requested(&self) -> bool {
        self.flags & FLAG_CONCURRENCY != 0
    }

    pub(crate) fn set_flag(&mut self, flag: u8, on: bool) {
        if on {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    /// Releases every intern reference this node owns. Called by the sweep
    /// and by eager frees; the node must not be used afterwards.
    pub(crate) fn release_intern_refs(&mut self) {
        let pool = intern::pool();
        if !self.symbol.is_none() {
            pool.release(self.symbol);
            self.symbol = SymbolId::NONE;
        }
        for &label in &self.labels {
            pool.release(label);
        }
        self.labels.clear();
        if !self.comment.is_none() {
            pool.release(self.comment);
            self.comment = SymbolId::NONE;
        }
        for (&key, _) in &self.mapped {
            pool.release(key);
        }
        self.mapped.clear();
        self.ordered.clear();
    }

    /// First private label (leading `!`), if any.
    pub fn private_label(&self) -> Option<SymbolId> {
        self.labels
            .iter()
            .copied()
            .find(|&l| intern::text(l).starts_with(PRIVATE_LABEL_SIGIL))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_roundtrip() {
        for kind in [
            NodeKind::Add,
            NodeKind::CallSandboxed,
            NodeKind::QueryNearestGeneralizedDistance,
            NodeKind::ZipLabels,
            NodeKind::TypeNequals,
            NodeKind::Assoc,
        ] {
            assert_eq!(NodeKind::from_name(kind.name()), Some(kind));
        }
    }

    #[test]
    fn internal_kinds_do_not_parse() {
        assert_eq!(NodeKind::from_name("deallocated"), None);
        assert_eq!(NodeKind::from_name("uninitialized"), None);
    }

    #[test]
    fn child_container_classification() {
        assert!(NodeKind::Assoc.uses_mapped_children());
        assert!(!NodeKind::Assoc.uses_ordered_children());
        assert!(NodeKind::List.uses_ordered_children());
        assert!(NodeKind::Seq.uses_ordered_children());
        assert!(!NodeKind::Number.uses_ordered_children());
        assert!(NodeKind::Number.is_immediate());
    }

    #[test]
    fn flags_toggle() {
        let mut n = Node::new(NodeKind::List);
        assert!(!n.need_cycle_check());
        n.set_flag(FLAG_NEED_CYCLE_CHECK, true);
        assert!(n.need_cycle_check());
        n.set_flag(FLAG_NEED_CYCLE_CHECK, false);
        assert!(!n.need_cycle_check());
    }
}
