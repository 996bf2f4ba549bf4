use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use super::key::{BlendKey, FetchKey, FsKey, GsKey, TcsKey, TesKey, VsKey};
use super::{ShaderDescription, VariantKind};

/// Attribute slots passed between stages.
pub const MAX_ATTRIBUTES: usize = 32;

/// One vertex buffer as seen by a fetch function.
///
/// Addresses are relative to vertex zero of the binding. `bytes` holds only
/// the part the draw may touch, which starts at address `base`.
#[derive(Debug, Clone, Copy)]
pub struct FetchBuffer<'a> {
    pub bytes: &'a [u8],
    pub base: u64,
    pub stride: u32,
}

impl<'a> FetchBuffer<'a> {
    /// Bytes at absolute address `addr`, or `None` when outside the window.
    pub fn read(&self, addr: u64, len: usize) -> Option<&'a [u8]> {
        let start = usize::try_from(addr.checked_sub(self.base)?).ok()?;
        self.bytes.get(start..start.checked_add(len)?)
    }
}

/// Arguments of a single shader function call.
///
/// Vertex-like stages read `inputs` and fill `outputs`. Fetch functions read
/// `buffers` and fill `outputs`. Fragment functions also see the pixel
/// `position`. Blend functions get `[src, dst]` in `inputs` and write the
/// result to `outputs[0]`.
pub struct Invocation<'a> {
    pub inputs: &'a [[f32; 4]],
    pub outputs: &'a mut [[f32; 4]],
    pub constants: &'a [u8],
    pub buffers: &'a [FetchBuffer<'a>],
    pub vertex_id: u32,
    pub instance_id: u32,
    pub position: [f32; 2],
}

impl<'a> Invocation<'a> {
    pub fn new(inputs: &'a [[f32; 4]], outputs: &'a mut [[f32; 4]]) -> Self {
        Self {
            inputs,
            outputs,
            constants: &[],
            buffers: &[],
            vertex_id: 0,
            instance_id: 0,
            position: [0.0; 2],
        }
    }
}

pub type ShaderFn = Arc<dyn Fn(&mut Invocation<'_>) + Send + Sync>;

/// Callable entry point of a compiled variant. Cheap to clone; clones compare
/// equal with [`ShaderEntry::same_as`].
#[derive(Clone)]
pub struct ShaderEntry {
    kind: VariantKind,
    func: ShaderFn,
}

impl ShaderEntry {
    pub fn new(kind: VariantKind, func: ShaderFn) -> Self {
        Self { kind, func }
    }

    pub fn kind(&self) -> VariantKind {
        self.kind
    }

    pub fn call(&self, invocation: &mut Invocation<'_>) {
        (self.func)(invocation)
    }

    pub fn same_as(&self, other: &ShaderEntry) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }
}

impl fmt::Debug for ShaderEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShaderEntry")
            .field("kind", &self.kind)
            .field("func", &Arc::as_ptr(&self.func).cast::<()>())
            .finish()
    }
}

/// Opaque owner of the code behind a [`ShaderEntry`]. Dropping it frees the
/// code.
pub trait CompiledModule: Send + Sync + fmt::Debug {}

/// Entry point plus the module that owns it.
#[derive(Debug)]
pub struct CompiledVariant {
    pub entry: ShaderEntry,
    pub module: Box<dyn CompiledModule>,
}

/// Key passed to the compilation service, typed by what is being compiled.
#[derive(Debug, Clone, Copy)]
pub enum CompileKey<'a> {
    Vertex(&'a VsKey),
    TessControl(&'a TcsKey),
    TessEval(&'a TesKey),
    Geometry(&'a GsKey),
    Fragment(&'a FsKey),
    Fetch(&'a FetchKey),
    Blend(&'a BlendKey),
}

impl CompileKey<'_> {
    pub fn kind(&self) -> VariantKind {
        match self {
            CompileKey::Vertex(_) => VariantKind::Vertex,
            CompileKey::TessControl(_) => VariantKind::TessControl,
            CompileKey::TessEval(_) => VariantKind::TessEval,
            CompileKey::Geometry(_) => VariantKind::Geometry,
            CompileKey::Fragment(_) => VariantKind::Fragment,
            CompileKey::Fetch(_) => VariantKind::Fetch,
            CompileKey::Blend(_) => VariantKind::Blend,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CompileRequest<'a> {
    /// `None` for fetch and blend variants.
    pub shader: Option<&'a ShaderDescription>,
    pub key: CompileKey<'a>,
}

impl CompileRequest<'_> {
    pub fn kind(&self) -> VariantKind {
        self.key.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?} compilation failed: {reason}")]
pub struct CompileError {
    pub kind: VariantKind,
    pub reason: String,
}

/// Turns IR plus a fixed-function key into machine code.
///
/// Must be a pure function of the request: the variant cache assumes two
/// requests with equal IR and byte-equal keys produce interchangeable code.
pub trait CompilationService: Send + Sync {
    fn compile(&self, request: &CompileRequest<'_>) -> Result<CompiledVariant, CompileError>;
}
