//! Core IR data types.

use bitflags::bitflags;

/// Maximum number of varying slots addressable by a program (fits a `u64`
/// `outputs_written` mask).
pub const MAX_VARYING_SLOTS: usize = 64;

/// Maximum number of geometry-shader vertex streams.
pub const MAX_VERTEX_STREAMS: usize = 4;

/// Maximum number of transform-feedback buffers.
pub const MAX_XFB_BUFFERS: usize = 4;

/// Well-known varying slot indices.
pub mod slot {
    pub const POSITION: u32 = 0;
    pub const PSIZ: u32 = 1;
    pub const LAYER: u32 = 2;
    pub const VIEWPORT: u32 = 3;
    pub const CLIP_DIST0: u32 = 4;
    pub const CLIP_DIST1: u32 = 5;
    /// First generic varying slot.
    pub const VAR0: u32 = 16;
}

/// Runtime encodings of the API primitive topology, as stored in the geometry
/// parameter block's `input_topology` field.
pub mod topology {
    pub const POINTS: u64 = 0;
    pub const LINES: u64 = 1;
    pub const LINE_LOOP: u64 = 2;
    pub const LINE_STRIP: u64 = 3;
    pub const TRIANGLES: u64 = 4;
    pub const TRIANGLE_STRIP: u64 = 5;
    pub const TRIANGLE_FAN: u64 = 6;
    pub const LINES_ADJACENCY: u64 = 7;
    pub const LINE_STRIP_ADJACENCY: u64 = 8;
    pub const TRIANGLES_ADJACENCY: u64 = 9;
    pub const TRIANGLE_STRIP_ADJACENCY: u64 = 10;
}

/// SSA-ish value identifier. Defined by at most one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

/// Local variable identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(pub u32);

bitflags! {
    /// 4-component write/read mask (x = bit 0).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ComponentMask: u8 {
        const X = 1 << 0;
        const Y = 1 << 1;
        const Z = 1 << 2;
        const W = 1 << 3;
    }
}

impl ComponentMask {
    pub const XYZW: Self = Self::all();

    /// Mask selecting a single component.
    pub fn component(c: u8) -> Self {
        Self::from_bits_truncate(1 << c)
    }

    pub fn count(self) -> u32 {
        self.bits().count_ones()
    }
}

/// Instruction source: either a defined value or an inline immediate.
///
/// Immediates are untyped 64-bit words; integer ALU ops interpret them as
/// unsigned unless noted, and float constants travel as IEEE bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Src {
    Value(ValueId),
    Imm(u64),
}

impl Src {
    pub fn as_imm(self) -> Option<u64> {
        match self {
            Src::Imm(v) => Some(v),
            Src::Value(_) => None,
        }
    }

    pub fn is_const(self) -> bool {
        matches!(self, Src::Imm(_))
    }
}

impl From<ValueId> for Src {
    fn from(v: ValueId) -> Self {
        Src::Value(v)
    }
}

/// Shader stage of a [`Program`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Vertex,
    Geometry,
    Compute,
}

/// Input primitive class declared by a geometry shader.
///
/// This is the *class*; the concrete API topology (list/strip/fan/loop)
/// arrives at runtime through the geometry parameter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveClass {
    Points,
    Lines,
    Triangles,
    LinesAdjacency,
    TrianglesAdjacency,
}

impl PrimitiveClass {
    /// Vertices consumed per input primitive.
    pub fn vertices_in(self) -> u32 {
        match self {
            PrimitiveClass::Points => 1,
            PrimitiveClass::Lines => 2,
            PrimitiveClass::Triangles => 3,
            PrimitiveClass::LinesAdjacency => 4,
            PrimitiveClass::TrianglesAdjacency => 6,
        }
    }
}

/// Output primitive of a geometry shader, before or after decomposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPrimitive {
    Points,
    Lines,
    LineStrip,
    Triangles,
    TriangleStrip,
}

impl OutputPrimitive {
    /// The basic primitive a strip output reduces to.
    pub fn decomposed(self) -> Self {
        match self {
            OutputPrimitive::Points => OutputPrimitive::Points,
            OutputPrimitive::Lines | OutputPrimitive::LineStrip => OutputPrimitive::Lines,
            OutputPrimitive::Triangles | OutputPrimitive::TriangleStrip => {
                OutputPrimitive::Triangles
            }
        }
    }

    /// Vertices needed to complete one decomposed primitive (ring depth).
    pub fn vertices_per_decomposed(self) -> u32 {
        match self.decomposed() {
            OutputPrimitive::Points => 1,
            OutputPrimitive::Lines => 2,
            OutputPrimitive::Triangles => 3,
            _ => unreachable!(),
        }
    }
}

/// System values a program may read. Lowering replaces these per derived
/// program; none survive into backend-ready code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sysval {
    /// Input primitive index within the draw.
    PrimitiveId,
    /// Instance index.
    InstanceId,
    /// Geometry-shader invocation index (instancing).
    InvocationId,
    /// Hardware vertex index (vertex stage only).
    VertexId,
    /// Non-zero when the provoking vertex is the last of the primitive.
    ProvokingLast,
    /// Runtime API topology of the input assembly (`topology::*` encoding).
    InputTopology,
    /// Bitmask of flat-shaded output slots.
    FlatMask,
}

/// Atomic memory operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
    Add,
    And,
    Or,
    Xor,
    UMin,
    UMax,
    Exchange,
}

/// Scalar ALU operations. All integer ops are untyped 64-bit-word ops;
/// comparisons produce 0 or 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Iadd,
    Isub,
    Imul,
    Udiv,
    Umod,
    Ishl,
    Ushr,
    Iand,
    Ior,
    Ixor,
    Inot,
    Ieq,
    Ine,
    Ult,
    Uge,
    Umin,
    Umax,
    BitCount,
    /// `bcsel(cond, a, b)`: `a` when `cond` is non-zero, else `b`.
    Bcsel,
}

impl AluOp {
    pub fn num_srcs(self) -> usize {
        match self {
            AluOp::Inot | AluOp::BitCount => 1,
            AluOp::Bcsel => 3,
            _ => 2,
        }
    }
}

/// A straight-line sequence of instructions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block(pub Vec<Instr>);

/// One instruction: an optional defined value plus the operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    pub dst: Option<ValueId>,
    pub op: Op,
}

/// The closed set of operations. Every lowering stage is a total match over
/// this enum: transformation or pass-through, nothing partial.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Materialize an immediate as a value (used where a `ValueId` is
    /// required; most immediates travel inline as [`Src::Imm`]).
    Imm(u64),
    /// Undefined vector value.
    Undef { comps: u8 },
    Alu { op: AluOp, srcs: Vec<Src> },
    /// Gather the masked components of `value` into a packed vector,
    /// substituting zero for components the producer never wrote.
    Channels { value: Src, mask: ComponentMask },
    Sysval(Sysval),
    /// Compute dispatch index, channel 0 = x, 1 = y.
    DispatchId { channel: u8 },
    /// Base address of the geometry parameter block.
    ParamBase,
    LoadGlobal { addr: Src, bytes: u8, comps: u8 },
    StoreGlobal { addr: Src, value: Src, mask: ComponentMask },
    GlobalAtomic { op: AtomicOp, addr: Src, value: Src },
    GlobalAtomicSwap { addr: Src, compare: Src, value: Src },
    LoadVar(VarId),
    StoreVar { var: VarId, value: Src, mask: ComponentMask },
    /// Read one input varying of a primitive vertex (`vertex` is the
    /// vertex-in-primitive index until input lowering rewrites it).
    LoadPerVertexInput { location: u32, component: u8, vertex: Src, comps: u8 },
    /// Scalarized output store.
    StoreOutput { location: u32, component: u8, value: Src },

    // Raw geometry ops, as produced by the front-end.
    EmitVertex { stream: u8 },
    EndPrimitive { stream: u8 },

    // Counted geometry ops, as produced by `mica-gs`' counter insertion.
    EmitVertexCounted {
        stream: u8,
        /// Invocation-local output vertex id (vertices emitted before this).
        vertex_id: Src,
        /// Index of this vertex within the current strip.
        index_in_strip: Src,
        /// Invocation-local decomposed primitive id completed by this emit.
        primitive_id: Src,
    },
    EndPrimitiveCounted {
        stream: u8,
        /// Total vertices emitted, counting this strip.
        total_vertices: Src,
        /// Vertices in the strip being ended.
        vertices_in_prim: Src,
        /// Strips ended so far, counting this one.
        total_primitives: Src,
    },
    /// Final per-stream counts: vertices, ended strips, decomposed
    /// primitives. For point output all three equal the vertex count.
    SetCounts { stream: u8, vertices: Src, primitives: Src, decomposed: Src },

    If { cond: Src, then_block: Block, else_block: Block },
    Loop { body: Block },
    Break,
}

impl Op {
    /// Visit every source operand.
    pub fn visit_srcs(&self, f: &mut impl FnMut(&Src)) {
        match self {
            Op::Imm(_)
            | Op::Undef { .. }
            | Op::Sysval(_)
            | Op::DispatchId { .. }
            | Op::ParamBase
            | Op::LoadVar(_)
            | Op::EmitVertex { .. }
            | Op::EndPrimitive { .. }
            | Op::Break => {}
            Op::Alu { srcs, .. } => srcs.iter().for_each(f),
            Op::Channels { value, .. } => f(value),
            Op::LoadGlobal { addr, .. } => f(addr),
            Op::StoreGlobal { addr, value, .. } => {
                f(addr);
                f(value);
            }
            Op::GlobalAtomic { addr, value, .. } => {
                f(addr);
                f(value);
            }
            Op::GlobalAtomicSwap { addr, compare, value } => {
                f(addr);
                f(compare);
                f(value);
            }
            Op::StoreVar { value, .. } => f(value),
            Op::LoadPerVertexInput { vertex, .. } => f(vertex),
            Op::StoreOutput { value, .. } => f(value),
            Op::EmitVertexCounted { vertex_id, index_in_strip, primitive_id, .. } => {
                f(vertex_id);
                f(index_in_strip);
                f(primitive_id);
            }
            Op::EndPrimitiveCounted {
                total_vertices,
                vertices_in_prim,
                total_primitives,
                ..
            } => {
                f(total_vertices);
                f(vertices_in_prim);
                f(total_primitives);
            }
            Op::SetCounts { vertices, primitives, decomposed, .. } => {
                f(vertices);
                f(primitives);
                f(decomposed);
            }
            Op::If { cond, .. } => f(cond),
            Op::Loop { .. } => {}
        }
    }

    /// Whether this operation has an observable effect beyond its defined
    /// value. Control flow is judged by its contents, not here.
    pub fn has_side_effect(&self) -> bool {
        matches!(
            self,
            Op::StoreGlobal { .. }
                | Op::GlobalAtomic { .. }
                | Op::GlobalAtomicSwap { .. }
                | Op::StoreVar { .. }
                | Op::StoreOutput { .. }
                | Op::EmitVertex { .. }
                | Op::EndPrimitive { .. }
                | Op::EmitVertexCounted { .. }
                | Op::EndPrimitiveCounted { .. }
                | Op::SetCounts { .. }
                | Op::Break
        )
    }
}

/// Geometry-shader metadata carried on a [`Program`].
#[derive(Debug, Clone, PartialEq)]
pub struct GsMeta {
    pub input_primitive: PrimitiveClass,
    pub output_primitive: OutputPrimitive,
    /// Shader-declared maximum vertices emitted per invocation.
    pub max_vertices_out: u32,
    /// Geometry-shader instancing count (1 = no instancing).
    pub invocations: u32,
    /// Bitmask of streams the shader emits on.
    pub active_stream_mask: u8,
}

/// One transform-feedback captured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XfbOutput {
    pub buffer: u8,
    pub location: u32,
    pub component_mask: ComponentMask,
    /// Byte offset within each captured vertex.
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct XfbBuffer {
    /// Byte stride between captured vertices.
    pub stride: u32,
}

/// Transform-feedback layout captured from the front-end.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct XfbInfo {
    /// Bitmask of buffers written.
    pub buffers_written: u8,
    pub buffers: [XfbBuffer; MAX_XFB_BUFFERS],
    pub buffer_to_stream: [u8; MAX_XFB_BUFFERS],
    pub outputs: Vec<XfbOutput>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarInfo {
    pub comps: u8,
    pub name: Option<String>,
}

/// A single shader program.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub name: String,
    pub stage: Stage,
    pub body: Block,
    next_value: u32,
    pub vars: Vec<VarInfo>,
    /// Bitmask over varying slots this program writes.
    pub outputs_written: u64,
    /// Highest component count written per varying slot.
    pub output_components: [u8; MAX_VARYING_SLOTS],
    pub gs: Option<GsMeta>,
    pub xfb: Option<XfbInfo>,
}

impl Program {
    pub fn new(name: impl Into<String>, stage: Stage) -> Self {
        Program {
            name: name.into(),
            stage,
            body: Block::default(),
            next_value: 0,
            vars: Vec::new(),
            outputs_written: 0,
            output_components: [0; MAX_VARYING_SLOTS],
            gs: None,
            xfb: None,
        }
    }

    pub fn alloc_value(&mut self) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        id
    }

    pub fn alloc_var(&mut self, comps: u8, name: Option<String>) -> VarId {
        let id = VarId(self.vars.len() as u32);
        self.vars.push(VarInfo { comps, name });
        id
    }

    /// Geometry metadata; panics on non-geometry programs.
    pub fn gs_meta(&self) -> &GsMeta {
        self.gs.as_ref().expect("geometry program metadata")
    }

    /// Ring depth: vertices per decomposed output primitive.
    pub fn verts_in_output_prim(&self) -> u32 {
        self.gs_meta().output_primitive.vertices_per_decomposed()
    }
}
