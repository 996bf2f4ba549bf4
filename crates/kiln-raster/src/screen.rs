//! Resource factory and owner of the engine-wide services.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::{Backend, SoftwareBackend};
use crate::config::{EngineConfig, MAX_SAMPLE_COUNT};
use crate::context::Context;
use crate::error::{EngineError, EngineResult};
use crate::resource::{
    BindFlags, DisplayTarget, Format, Resource, ResourceDesc, ResourceId, ResourceTarget,
};
use crate::shader::{CompilationService, PassthroughCompiler, ShaderDescription, ShaderId, ShaderObject};
use crate::stats::EngineStats;

struct ScreenShared {
    config: EngineConfig,
    backend: Arc<dyn Backend>,
    compiler: Arc<dyn CompilationService>,
    stats: Arc<EngineStats>,
    next_resource: AtomicU32,
    next_shader: AtomicU64,
}

/// Shared by every context created from it. Cloning is cheap.
#[derive(Clone)]
pub struct Screen {
    shared: Arc<ScreenShared>,
}

impl Screen {
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn Backend>,
        compiler: Arc<dyn CompilationService>,
    ) -> EngineResult<Self> {
        config.validate()?;
        tracing::debug!(
            max_draws_in_flight = config.max_draws_in_flight,
            client_copy_limit = config.client_copy_limit,
            msaa_max_samples = config.msaa_max_samples,
            msaa_force_enable = config.msaa_force_enable,
            "created screen"
        );
        Ok(Self {
            shared: Arc::new(ScreenShared {
                config,
                backend,
                compiler,
                stats: Arc::new(EngineStats::new()),
                next_resource: AtomicU32::new(1),
                next_shader: AtomicU64::new(1),
            }),
        })
    }

    /// Screen rendering with [`SoftwareBackend`] and compiling with
    /// [`PassthroughCompiler`].
    pub fn with_software_backend(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let backend = Arc::new(SoftwareBackend::new(&config));
        Self::new(config, backend, Arc::new(PassthroughCompiler::new()))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.shared.backend
    }

    pub fn compiler(&self) -> &Arc<dyn CompilationService> {
        &self.shared.compiler
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.shared.stats
    }

    pub fn is_format_supported(
        &self,
        format: Format,
        target: ResourceTarget,
        samples: u32,
        bind: BindFlags,
    ) -> bool {
        if target == ResourceTarget::Buffer {
            return samples <= 1
                && !bind.intersects(BindFlags::RENDER_TARGET | BindFlags::DEPTH_STENCIL);
        }
        if bind.intersects(BindFlags::VERTEX_BUFFER | BindFlags::INDEX_BUFFER | BindFlags::CONSTANT_BUFFER) {
            return false;
        }
        if bind.intersects(BindFlags::RENDER_TARGET | BindFlags::DISPLAY_TARGET) && !format.is_color() {
            return false;
        }
        if bind.contains(BindFlags::DEPTH_STENCIL) && !format.is_depth_stencil() {
            return false;
        }
        if samples > 1 {
            let max = self.shared.config.msaa_max_samples.min(MAX_SAMPLE_COUNT);
            return samples.is_power_of_two()
                && samples <= max
                && bind.intersects(BindFlags::RENDER_TARGET | BindFlags::DEPTH_STENCIL);
        }
        true
    }

    fn next_resource_id(&self) -> ResourceId {
        ResourceId(self.shared.next_resource.fetch_add(1, Ordering::Relaxed))
    }

    fn check_desc(&self, desc: &ResourceDesc) -> EngineResult<()> {
        let max = self.shared.config.msaa_max_samples;
        if desc.samples > max || !desc.samples.is_power_of_two() {
            return Err(EngineError::UnsupportedSampleCount {
                requested: desc.samples,
                max,
            });
        }
        if !self.is_format_supported(desc.format, desc.target, desc.samples, desc.bind) {
            return Err(EngineError::UnsupportedFormat {
                format: desc.format,
                usage: "the requested bind flags",
            });
        }
        Ok(())
    }

    /// Allocate a resource with engine-owned storage.
    ///
    /// Multisampled resources also get a single-sample resolve target that
    /// tile stores keep up to date.
    pub fn create_resource(&self, desc: ResourceDesc) -> EngineResult<Resource> {
        let mut desc = desc;
        let config = &self.shared.config;
        if config.msaa_force_enable
            && config.msaa_max_samples > 1
            && desc.target == ResourceTarget::Texture2D
            && desc.is_render_target()
            && desc.samples == 1
        {
            desc.samples = config.msaa_max_samples;
        }
        self.check_desc(&desc)?;

        let resolve_target = (desc.samples > 1).then(|| {
            let single = ResourceDesc {
                samples: 1,
                ..desc.clone()
            };
            Resource::new_owned(self.next_resource_id(), single, None)
        });
        let resource = Resource::new_owned(self.next_resource_id(), desc, resolve_target);
        tracing::trace!(
            resource = %resource.id(),
            format = ?resource.format(),
            width = resource.width(),
            height = resource.height(),
            samples = resource.samples(),
            "created resource"
        );
        Ok(resource)
    }

    /// Wrap externally owned display memory. Display targets are always
    /// single-sampled.
    pub fn create_display_target(
        &self,
        desc: ResourceDesc,
        target: Arc<dyn DisplayTarget>,
    ) -> EngineResult<Resource> {
        let desc = ResourceDesc {
            bind: desc.bind | BindFlags::DISPLAY_TARGET,
            ..desc
        };
        self.check_desc(&desc)?;
        if desc.samples != 1 || desc.target != ResourceTarget::Texture2D {
            return Err(EngineError::UnsupportedFormat {
                format: desc.format,
                usage: "display targets",
            });
        }
        let row = desc.width as usize * desc.format.bytes_per_pixel() as usize;
        if target.stride() < row {
            return Err(EngineError::UnsupportedFormat {
                format: desc.format,
                usage: "a display target narrower than its width",
            });
        }
        Ok(Resource::new_display(self.next_resource_id(), desc, target))
    }

    pub fn create_shader(&self, desc: ShaderDescription) -> Arc<ShaderObject> {
        let id = ShaderId(self.shared.next_shader.fetch_add(1, Ordering::Relaxed));
        Arc::new(ShaderObject::new(id, desc))
    }

    pub fn create_context(&self) -> Context {
        Context::new(self.clone())
    }
}

impl fmt::Debug for Screen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Screen")
            .field("config", &self.shared.config)
            .field("stats", &self.shared.stats.snapshot())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::RecordingBackend;

    fn screen(config: EngineConfig) -> Screen {
        Screen::new(
            config,
            Arc::new(RecordingBackend::inline()),
            Arc::new(PassthroughCompiler::new()),
        )
        .unwrap()
    }

    #[test]
    fn sample_counts_are_bounded_by_config() {
        let screen = screen(EngineConfig {
            msaa_max_samples: 4,
            ..EngineConfig::default()
        });
        let desc = ResourceDesc::texture_2d(Format::Rgba8Unorm, 4, 4, BindFlags::RENDER_TARGET);

        let msaa = screen.create_resource(desc.clone().with_samples(4)).unwrap();
        assert_eq!(msaa.samples(), 4);
        assert_eq!(msaa.resolve_target().map(Resource::samples), Some(1));

        assert_eq!(
            screen.create_resource(desc.with_samples(8)).unwrap_err(),
            EngineError::UnsupportedSampleCount {
                requested: 8,
                max: 4
            }
        );
    }

    #[test]
    fn forced_msaa_upgrades_render_targets_only() {
        let screen = screen(EngineConfig {
            msaa_max_samples: 4,
            msaa_force_enable: true,
            ..EngineConfig::default()
        });
        let rt = screen
            .create_resource(ResourceDesc::texture_2d(Format::Rgba8Unorm, 4, 4, BindFlags::RENDER_TARGET))
            .unwrap();
        assert_eq!(rt.samples(), 4);
        assert!(rt.resolve_target().is_some());

        let tex = screen
            .create_resource(ResourceDesc::texture_2d(Format::Rgba8Unorm, 4, 4, BindFlags::SAMPLER_VIEW))
            .unwrap();
        assert_eq!(tex.samples(), 1);
        assert!(tex.resolve_target().is_none());
    }

    #[test]
    fn format_support_follows_bind_flags() {
        let screen = screen(EngineConfig::default());
        let tex = ResourceTarget::Texture2D;
        assert!(screen.is_format_supported(Format::Z24UnormS8Uint, tex, 1, BindFlags::DEPTH_STENCIL));
        assert!(!screen.is_format_supported(Format::Z24UnormS8Uint, tex, 1, BindFlags::RENDER_TARGET));
        assert!(!screen.is_format_supported(Format::Rgba8Unorm, tex, 1, BindFlags::DEPTH_STENCIL));
        assert!(!screen.is_format_supported(Format::Rgba8Unorm, tex, 2, BindFlags::RENDER_TARGET));
        assert!(screen.is_format_supported(
            Format::R8Unorm,
            ResourceTarget::Buffer,
            1,
            BindFlags::VERTEX_BUFFER
        ));
    }

    #[test]
    fn fused_depth_stencil_gets_a_stencil_plane() {
        let screen = screen(EngineConfig::default());
        let zs = screen
            .create_resource(ResourceDesc::texture_2d(Format::Z32FloatS8X24Uint, 4, 4, BindFlags::DEPTH_STENCIL))
            .unwrap();
        assert!(zs.has_stencil_plane());
        assert!(!zs.is_display_target());
    }
}
