//! Alignment and packing rules for uniform data.
//!
//! Uniform buffer blocks follow the std140-style layout rule that every
//! "row" is vec4-aligned: a vec3 array element occupies four floats, a mat3
//! column occupies four floats, and only vec4/mat4 data is already tight.
//! This module converts tightly-packed CPU arrays into that padded layout
//! and computes member offsets for the generated scalar-uniform block.

use std::borrow::Cow;

use sandbox_project::{ElementType, ScalarType};

/// Components carried per element, tightly packed.
pub fn component_count(ty: ElementType) -> usize {
    match ty {
        ElementType::Float => 1,
        ElementType::Vec2 => 2,
        ElementType::Vec3 => 3,
        ElementType::Vec4 => 4,
        ElementType::Mat3 => 9,
        ElementType::Mat4 => 16,
    }
}

/// Components occupied per element once padded to vec4-aligned rows.
///
/// vec3 wastes one slot; mat3 stores three columns of four (trailing zero
/// each); mat4 needs no padding.
pub fn padded_components_per_element(ty: ElementType) -> usize {
    match ty {
        ElementType::Float | ElementType::Vec2 | ElementType::Vec3 | ElementType::Vec4 => 4,
        ElementType::Mat3 => 12,
        ElementType::Mat4 => 16,
    }
}

/// Byte size of a padded array of `count` elements.
pub fn padded_byte_size(ty: ElementType, count: u32) -> u64 {
    padded_components_per_element(ty) as u64 * 4 * count as u64
}

/// Converts a tightly-packed array into the padded layout.
///
/// `tight.len()` must be a multiple of [`component_count`]; the element
/// count is derived from it. Types whose tight and padded sizes coincide
/// (vec4, mat4) are returned borrowed without copying.
pub fn repack_tight_to_padded(ty: ElementType, tight: &[f32]) -> Cow<'_, [f32]> {
    let comps = component_count(ty);
    let padded = padded_components_per_element(ty);
    debug_assert_eq!(tight.len() % comps, 0);
    if comps == padded {
        return Cow::Borrowed(tight);
    }

    let count = tight.len() / comps;
    let mut out = vec![0.0f32; count * padded];
    write_padded(ty, tight, &mut out);
    Cow::Owned(out)
}

/// Writes the padded form of `tight` into the front of `out`, zero-filling
/// the whole target first so any tail beyond the live elements reads 0.
pub fn write_padded(ty: ElementType, tight: &[f32], out: &mut [f32]) {
    let comps = component_count(ty);
    let padded = padded_components_per_element(ty);
    debug_assert_eq!(tight.len() % comps, 0);
    let count = tight.len() / comps;
    debug_assert!(out.len() >= count * padded);

    out.fill(0.0);
    match ty {
        // mat3: redistribute three columns of three into three columns of
        // four with a trailing zero each.
        ElementType::Mat3 => {
            for element in 0..count {
                let src = &tight[element * 9..element * 9 + 9];
                let dst = &mut out[element * 12..element * 12 + 12];
                for column in 0..3 {
                    dst[column * 4..column * 4 + 3]
                        .copy_from_slice(&src[column * 3..column * 3 + 3]);
                }
            }
        }
        _ => {
            for element in 0..count {
                let src = &tight[element * comps..element * comps + comps];
                out[element * padded..element * padded + comps].copy_from_slice(src);
            }
        }
    }
}

/// std140 alignment of a scalar-block member, in floats.
fn scalar_align(ty: ScalarType) -> usize {
    match ty {
        ScalarType::Float | ScalarType::Int | ScalarType::Bool => 1,
        ScalarType::Vec2 => 2,
        ScalarType::Vec3 | ScalarType::Vec4 => 4,
    }
}

/// std140 size of a scalar-block member, in floats.
fn scalar_size(ty: ScalarType) -> usize {
    match ty {
        ScalarType::Float | ScalarType::Int | ScalarType::Bool => 1,
        ScalarType::Vec2 => 2,
        ScalarType::Vec3 => 3,
        ScalarType::Vec4 => 4,
    }
}

#[derive(Debug, Clone)]
pub struct Std140Member {
    pub name: String,
    pub ty: ScalarType,
    /// Offset inside the block, in floats.
    pub offset: usize,
}

/// Member offsets for a std140 block of scalar/vector values.
///
/// The CPU mirror of the generated `CustomParams` block is laid out with
/// this; the GLSL emitted by the source builder declares the members in the
/// same order, so driver and mirror agree by construction.
#[derive(Debug, Clone, Default)]
pub struct Std140Layout {
    members: Vec<Std140Member>,
    size: usize,
}

impl Std140Layout {
    pub fn new(members: impl IntoIterator<Item = (String, ScalarType)>) -> Self {
        let mut resolved = Vec::new();
        let mut cursor = 0usize;
        for (name, ty) in members {
            let align = scalar_align(ty);
            cursor = cursor.div_ceil(align) * align;
            resolved.push(Std140Member {
                name,
                ty,
                offset: cursor,
            });
            cursor += scalar_size(ty);
        }
        // Block size rounds up to a vec4 boundary.
        let size = cursor.div_ceil(4) * 4;
        Self {
            members: resolved,
            size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[Std140Member] {
        &self.members
    }

    pub fn offset(&self, name: &str) -> Option<usize> {
        self.members
            .iter()
            .find(|member| member.name == name)
            .map(|member| member.offset)
    }

    /// Total block size in floats (vec4-rounded).
    pub fn size_floats(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(ty: ElementType, count: usize) {
        let comps = component_count(ty);
        let padded = padded_components_per_element(ty);
        let tight: Vec<f32> = (0..comps * count).map(|i| i as f32 + 1.0).collect();

        let out = repack_tight_to_padded(ty, &tight);
        assert!(out.len() >= count * padded);

        for element in 0..count {
            for comp in 0..comps {
                let padded_index = match ty {
                    ElementType::Mat3 => element * 12 + (comp / 3) * 4 + comp % 3,
                    _ => element * padded + comp,
                };
                assert_eq!(
                    out[padded_index],
                    tight[element * comps + comp],
                    "{ty:?} element {element} component {comp}"
                );
            }
        }

        // Padding slots stay zero.
        for element in 0..count {
            match ty {
                ElementType::Mat3 => {
                    for column in 0..3 {
                        assert_eq!(out[element * 12 + column * 4 + 3], 0.0);
                    }
                }
                ElementType::Vec3 => assert_eq!(out[element * 4 + 3], 0.0),
                ElementType::Float => assert_eq!(&out[element * 4 + 1..element * 4 + 4], [0.0; 3]),
                ElementType::Vec2 => assert_eq!(&out[element * 4 + 2..element * 4 + 4], [0.0; 2]),
                _ => {}
            }
        }
    }

    #[test]
    fn padding_roundtrip_all_types_and_counts() {
        for ty in [
            ElementType::Float,
            ElementType::Vec2,
            ElementType::Vec3,
            ElementType::Vec4,
            ElementType::Mat3,
            ElementType::Mat4,
        ] {
            for count in [1, 5, 64] {
                roundtrip(ty, count);
            }
        }
    }

    #[test]
    fn vec4_and_mat4_borrow_without_copy() {
        let tight = vec![1.0f32; 32];
        assert!(matches!(
            repack_tight_to_padded(ElementType::Vec4, &tight),
            Cow::Borrowed(_)
        ));
        assert!(matches!(
            repack_tight_to_padded(ElementType::Mat4, &tight),
            Cow::Borrowed(_)
        ));
        assert!(matches!(
            repack_tight_to_padded(ElementType::Vec3, &tight[..30]),
            Cow::Owned(_)
        ));
    }

    #[test]
    fn mat3_columns_land_on_vec4_boundaries() {
        let tight: Vec<f32> = (1..=9).map(|i| i as f32).collect();
        let out = repack_tight_to_padded(ElementType::Mat3, &tight);
        assert_eq!(
            out.as_ref(),
            &[1.0, 2.0, 3.0, 0.0, 4.0, 5.0, 6.0, 0.0, 7.0, 8.0, 9.0, 0.0]
        );
    }

    #[test]
    fn std140_layout_aligns_vectors() {
        let layout = Std140Layout::new([
            ("a".to_string(), ScalarType::Float),
            ("b".to_string(), ScalarType::Vec3),
            ("c".to_string(), ScalarType::Float),
            ("d".to_string(), ScalarType::Vec2),
        ]);
        assert_eq!(layout.offset("a"), Some(0));
        assert_eq!(layout.offset("b"), Some(4));
        assert_eq!(layout.offset("c"), Some(7));
        assert_eq!(layout.offset("d"), Some(8));
        assert_eq!(layout.size_floats(), 12);
    }

    #[test]
    fn std140_layout_rounds_size_to_vec4() {
        let layout = Std140Layout::new([("a".to_string(), ScalarType::Float)]);
        assert_eq!(layout.size_floats(), 4);
        assert!(Std140Layout::new([]).is_empty());
        assert_eq!(Std140Layout::new([]).size_floats(), 0);
    }
}
