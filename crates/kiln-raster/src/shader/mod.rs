//! Shader objects and their compiled variants.
//!
//! A shader object owns the stage's IR plus a cache of variants keyed by the
//! fixed-layout keys in [`key`]. Variants are produced by a
//! [`CompilationService`]; their module handles are only dropped through the
//! fence once no queued draw can still call into them.

mod cache;
mod compiler;
pub mod key;
mod passthrough;

pub use cache::{VariantCache, VariantCacheStats};
pub use compiler::{
    CompilationService, CompileError, CompileKey, CompileRequest, CompiledModule,
    CompiledVariant, FetchBuffer, Invocation, ShaderEntry, ShaderFn, MAX_ATTRIBUTES,
};
pub use key::VariantKey;
pub use passthrough::{PassthroughCompiler, PassthroughModule};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::lock;
use crate::stats::EngineStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    Vertex,
    TessControl,
    TessEval,
    Geometry,
    Fragment,
}

impl ShaderStage {
    pub const COUNT: usize = 5;
    pub const ALL: [ShaderStage; Self::COUNT] = [
        ShaderStage::Vertex,
        ShaderStage::TessControl,
        ShaderStage::TessEval,
        ShaderStage::Geometry,
        ShaderStage::Fragment,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// What a compiled variant implements. Fetch and blend variants have no IR;
/// they are generated from their key alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariantKind {
    Vertex,
    TessControl,
    TessEval,
    Geometry,
    Fragment,
    Fetch,
    Blend,
}

impl From<ShaderStage> for VariantKind {
    fn from(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Vertex => VariantKind::Vertex,
            ShaderStage::TessControl => VariantKind::TessControl,
            ShaderStage::TessEval => VariantKind::TessEval,
            ShaderStage::Geometry => VariantKind::Geometry,
            ShaderStage::Fragment => VariantKind::Fragment,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum SemanticName {
    Position = 0,
    Color = 1,
    BackColor = 2,
    Fog = 3,
    PointSize = 4,
    #[default]
    Generic = 5,
    Normal = 6,
    Face = 7,
    ClipDistance = 8,
    PrimitiveId = 9,
    TexCoord = 10,
    PointCoord = 11,
    Layer = 12,
    ViewportIndex = 13,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Semantic {
    pub name: SemanticName,
    pub index: u8,
}

impl Semantic {
    pub const fn new(name: SemanticName, index: u8) -> Self {
        Self { name, index }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Interpolation {
    Constant,
    Linear,
    #[default]
    Perspective,
    /// Perspective unless flat shading is enabled.
    Color,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ShaderInput {
    pub semantic: Semantic,
    pub interpolation: Interpolation,
}

/// Reflection data the frontend needs without looking inside the IR.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShaderInfo {
    pub inputs: Vec<ShaderInput>,
    pub outputs: Vec<Semantic>,
    /// Sampler slots the shader reads.
    pub sampler_mask: u32,
    /// Sampler-view slots declared separately from samplers, if any.
    pub sampler_view_mask: Option<u32>,
    pub clip_distance_writemask: u32,
    pub writes_depth: bool,
    pub writes_point_size: bool,
    pub reads_layer: bool,
    pub reads_viewport_index: bool,
}

impl ShaderInfo {
    pub fn output_slot(&self, semantic: Semantic) -> Option<usize> {
        self.outputs.iter().position(|s| *s == semantic)
    }
}

/// Input to shader-object creation.
#[derive(Clone)]
pub struct ShaderDescription {
    pub stage: ShaderStage,
    pub ir: Arc<[u8]>,
    pub info: ShaderInfo,
    pub label: Option<String>,
}

impl ShaderDescription {
    pub fn new(stage: ShaderStage, ir: impl Into<Arc<[u8]>>, info: ShaderInfo) -> Self {
        Self {
            stage,
            ir: ir.into(),
            info,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

impl fmt::Debug for ShaderDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShaderDescription")
            .field("stage", &self.stage)
            .field("ir_len", &self.ir.len())
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaderId(pub u64);

pub struct ShaderObject {
    id: ShaderId,
    desc: ShaderDescription,
    ir_hash: u64,
    variants: Mutex<VariantCache>,
    released: AtomicBool,
}

impl ShaderObject {
    pub(crate) fn new(id: ShaderId, desc: ShaderDescription) -> Self {
        let ir_hash = xxhash_rust::xxh3::xxh3_64(&desc.ir);
        Self {
            id,
            desc,
            ir_hash,
            variants: Mutex::new(VariantCache::new()),
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ShaderId {
        self.id
    }

    pub fn stage(&self) -> ShaderStage {
        self.desc.stage
    }

    pub fn info(&self) -> &ShaderInfo {
        &self.desc.info
    }

    pub fn description(&self) -> &ShaderDescription {
        &self.desc
    }

    /// Hash of the IR bytes, used to tag logs and module labels.
    pub fn ir_hash(&self) -> u64 {
        self.ir_hash
    }

    pub fn label(&self) -> String {
        match &self.desc.label {
            Some(label) => label.clone(),
            None => format!("{:?}#{}", self.desc.stage, self.id.0),
        }
    }

    pub fn variant_count(&self) -> usize {
        lock(&self.variants).len()
    }

    pub fn cache_stats(&self) -> VariantCacheStats {
        lock(&self.variants).stats()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Return the variant for `key`, compiling it on a miss.
    ///
    /// # Panics
    ///
    /// If the compilation service fails: a missing shader function is never a
    /// valid state to hand the backend.
    pub fn get_or_compile<K: VariantKey>(
        &self,
        key: &K,
        compiler: &dyn CompilationService,
        stats: &EngineStats,
    ) -> ShaderEntry {
        assert_eq!(
            K::KIND,
            VariantKind::from(self.stage()),
            "variant key does not match shader stage"
        );
        assert!(
            !self.is_released(),
            "variant requested from deleted shader {}",
            self.label()
        );

        let mut variants = lock(&self.variants);
        let (entry, compiled) = variants.get_or_insert_with(key.as_bytes(), || {
            let request = CompileRequest {
                shader: Some(&self.desc),
                key: key.compile_key(),
            };
            compile_or_panic(compiler, &request, &self.label())
        });
        if compiled {
            stats.inc_variant_misses();
            stats.inc_variant_compiles();
            tracing::debug!(
                shader = %self.label(),
                ir_hash = self.ir_hash,
                variants = variants.len(),
                "compiled shader variant"
            );
        } else {
            stats.inc_variant_hits();
        }
        entry
    }

    /// Drop every compiled variant. Called from deferred work once in-flight
    /// draws can no longer reference them.
    pub(crate) fn release_variants(&self) {
        self.released.store(true, Ordering::Release);
        let drained = lock(&self.variants).drain();
        tracing::debug!(shader = %self.label(), variants = drained.len(), "released shader variants");
        drop(drained);
    }
}

pub(crate) fn compile_or_panic(
    compiler: &dyn CompilationService,
    request: &CompileRequest<'_>,
    label: &str,
) -> CompiledVariant {
    match compiler.compile(request) {
        Ok(variant) => {
            assert_eq!(
                variant.entry.kind(),
                request.kind(),
                "compilation service returned the wrong kind of entry point for {label}"
            );
            variant
        }
        Err(err) => panic!("failed to compile {label}: {err}"),
    }
}

impl Drop for ShaderObject {
    fn drop(&mut self) {
        if self.is_released() {
            return;
        }
        let variants = self
            .variants
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !variants.is_empty() {
            tracing::warn!(
                shader = self.id.0,
                variants = variants.len(),
                "shader object dropped without deferred deletion"
            );
        }
    }
}

impl fmt::Debug for ShaderObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShaderObject")
            .field("id", &self.id)
            .field("stage", &self.desc.stage)
            .field("ir_hash", &format_args!("{:016x}", self.ir_hash))
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}
