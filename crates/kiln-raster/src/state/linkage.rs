//! Mapping of fragment shader inputs onto the outputs of the last vertex
//! processing stage.

use crate::shader::{Interpolation, Semantic, SemanticName, ShaderInfo, MAX_ATTRIBUTES};

use super::RasterizerState;

/// How the backend feeds each fragment input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeLayout {
    pub num_attributes: u32,
    /// Producer output slot for each fragment input. `None` reads `(0, 0, 0, 1)`.
    pub source: [Option<u8>; MAX_ATTRIBUTES],
    /// Back-face color slot used instead of `source` under two-sided lighting.
    pub back_source: [Option<u8>; MAX_ATTRIBUTES],
    /// Inputs taken from the provoking vertex without interpolation.
    pub constant_interpolation_mask: u32,
    /// Inputs replaced by the point-sprite coordinate when drawing points.
    pub point_sprite_mask: u32,
    /// Producer slot holding the position.
    pub position_slot: Option<u8>,
}

impl Default for AttributeLayout {
    fn default() -> Self {
        Self {
            num_attributes: 0,
            source: [None; MAX_ATTRIBUTES],
            back_source: [None; MAX_ATTRIBUTES],
            constant_interpolation_mask: 0,
            point_sprite_mask: 0,
            position_slot: None,
        }
    }
}

fn slot(info: &ShaderInfo, semantic: Semantic) -> Option<u8> {
    info.output_slot(semantic)
        .and_then(|slot| u8::try_from(slot).ok())
        .filter(|slot| usize::from(*slot) < MAX_ATTRIBUTES)
}

pub fn derive_attribute_layout(
    fs: &ShaderInfo,
    producer: &ShaderInfo,
    rasterizer: &RasterizerState,
) -> AttributeLayout {
    let mut layout = AttributeLayout {
        position_slot: slot(producer, Semantic::new(SemanticName::Position, 0)),
        ..Default::default()
    };

    for (i, input) in fs.inputs.iter().take(MAX_ATTRIBUTES).enumerate() {
        let semantic = input.semantic;
        layout.source[i] = slot(producer, semantic);

        if semantic.name == SemanticName::Color && rasterizer.light_twoside {
            layout.back_source[i] = slot(
                producer,
                Semantic::new(SemanticName::BackColor, semantic.index),
            );
        }

        let flat = match input.interpolation {
            Interpolation::Constant => true,
            Interpolation::Color => rasterizer.flatshade,
            Interpolation::Linear | Interpolation::Perspective => false,
        };
        if flat {
            layout.constant_interpolation_mask |= 1 << i;
        }

        let sprite = match semantic.name {
            SemanticName::PointCoord => true,
            SemanticName::TexCoord => {
                semantic.index < 32 && rasterizer.sprite_coord_enable & (1 << semantic.index) != 0
            }
            _ => false,
        };
        if sprite {
            layout.point_sprite_mask |= 1 << i;
        }

        layout.num_attributes = i as u32 + 1;
    }
    layout
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::ShaderInput;

    fn input(name: SemanticName, index: u8, interpolation: Interpolation) -> ShaderInput {
        ShaderInput {
            semantic: Semantic::new(name, index),
            interpolation,
        }
    }

    fn producer() -> ShaderInfo {
        ShaderInfo {
            outputs: vec![
                Semantic::new(SemanticName::Position, 0),
                Semantic::new(SemanticName::Color, 0),
                Semantic::new(SemanticName::BackColor, 0),
                Semantic::new(SemanticName::TexCoord, 1),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn inputs_link_by_semantic() {
        let fs = ShaderInfo {
            inputs: vec![
                input(SemanticName::TexCoord, 1, Interpolation::Perspective),
                input(SemanticName::Color, 0, Interpolation::Color),
                input(SemanticName::Generic, 4, Interpolation::Linear),
            ],
            ..Default::default()
        };
        let layout = derive_attribute_layout(&fs, &producer(), &RasterizerState::default());
        assert_eq!(layout.num_attributes, 3);
        assert_eq!(&layout.source[..3], &[Some(3), Some(1), None]);
        assert_eq!(layout.back_source[1], None);
        assert_eq!(layout.position_slot, Some(0));
        assert_eq!(layout.constant_interpolation_mask, 0);
    }

    #[test]
    fn flatshade_and_twoside_affect_colors_only() {
        let fs = ShaderInfo {
            inputs: vec![
                input(SemanticName::Color, 0, Interpolation::Color),
                input(SemanticName::Generic, 0, Interpolation::Constant),
                input(SemanticName::TexCoord, 1, Interpolation::Perspective),
            ],
            ..Default::default()
        };
        let rasterizer = RasterizerState {
            flatshade: true,
            light_twoside: true,
            sprite_coord_enable: 1 << 1,
            ..Default::default()
        };
        let layout = derive_attribute_layout(&fs, &producer(), &rasterizer);
        assert_eq!(layout.constant_interpolation_mask, 0b011);
        assert_eq!(layout.back_source[0], Some(2));
        assert_eq!(layout.point_sprite_mask, 0b100);
    }
}
