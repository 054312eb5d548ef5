//! CPU-side store for custom uniform values.
//!
//! Scalar and vector uniforms live in one std140 mirror that backs the
//! generated `CustomParams` block; array uniforms each keep a tight CPU copy
//! plus a padded mirror for their dedicated block. Setters validate against
//! the declared types and reject bad writes with a warning instead of an
//! error, so a typo in host code degrades one knob rather than the render
//! loop.

use std::collections::BTreeMap;

use sandbox_project::{DefaultValue, ElementType, ScalarType, UniformDecl};

use crate::pack::{component_count, padded_components_per_element, write_padded, Std140Layout};

/// A typed value for a scalar custom uniform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Int(i32),
    Bool(bool),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
}

impl UniformValue {
    fn scalar_type(&self) -> ScalarType {
        match self {
            UniformValue::Float(_) => ScalarType::Float,
            UniformValue::Int(_) => ScalarType::Int,
            UniformValue::Bool(_) => ScalarType::Bool,
            UniformValue::Vec2(_) => ScalarType::Vec2,
            UniformValue::Vec3(_) => ScalarType::Vec3,
            UniformValue::Vec4(_) => ScalarType::Vec4,
        }
    }

    /// Float representation written into the std140 mirror. Ints and bools
    /// are carried as floats and cast back in generated GLSL.
    fn components(&self) -> [f32; 4] {
        match *self {
            UniformValue::Float(v) => [v, 0.0, 0.0, 0.0],
            UniformValue::Int(v) => [v as f32, 0.0, 0.0, 0.0],
            UniformValue::Bool(v) => [if v { 1.0 } else { 0.0 }, 0.0, 0.0, 0.0],
            UniformValue::Vec2([x, y]) => [x, y, 0.0, 0.0],
            UniformValue::Vec3([x, y, z]) => [x, y, z, 0.0],
            UniformValue::Vec4(v) => v,
        }
    }

    fn zero(ty: ScalarType) -> Self {
        match ty {
            ScalarType::Float => UniformValue::Float(0.0),
            ScalarType::Int => UniformValue::Int(0),
            ScalarType::Bool => UniformValue::Bool(false),
            ScalarType::Vec2 => UniformValue::Vec2([0.0; 2]),
            ScalarType::Vec3 => UniformValue::Vec3([0.0; 3]),
            ScalarType::Vec4 => UniformValue::Vec4([0.0; 4]),
        }
    }

    fn from_default(ty: ScalarType, default: Option<&DefaultValue>) -> Self {
        let Some(default) = default else {
            return Self::zero(ty);
        };
        let coerced = match (ty, default) {
            (ScalarType::Float, DefaultValue::Number(n)) => Some(UniformValue::Float(*n as f32)),
            (ScalarType::Int, DefaultValue::Number(n)) => Some(UniformValue::Int(*n as i32)),
            (ScalarType::Bool, DefaultValue::Bool(b)) => Some(UniformValue::Bool(*b)),
            (ScalarType::Bool, DefaultValue::Number(n)) => Some(UniformValue::Bool(*n != 0.0)),
            (ScalarType::Vec2, DefaultValue::Vector(v)) if v.len() == 2 => {
                Some(UniformValue::Vec2([v[0], v[1]]))
            }
            (ScalarType::Vec3, DefaultValue::Vector(v)) if v.len() == 3 => {
                Some(UniformValue::Vec3([v[0], v[1], v[2]]))
            }
            (ScalarType::Vec4, DefaultValue::Vector(v)) if v.len() == 4 => {
                Some(UniformValue::Vec4([v[0], v[1], v[2], v[3]]))
            }
            _ => None,
        };
        coerced.unwrap_or_else(|| {
            tracing::warn!(?ty, ?default, "uniform default does not match its type; using zero");
            Self::zero(ty)
        })
    }
}

#[derive(Debug, Clone)]
struct ScalarSlot {
    ty: ScalarType,
    value: UniformValue,
    default: UniformValue,
}

/// One array uniform: a tight CPU copy for reads plus a padded mirror
/// matching the std140 block the GPU sees.
#[derive(Debug, Clone)]
pub struct ArrayUniform {
    ty: ElementType,
    capacity: u32,
    tight: Vec<f32>,
    padded: Vec<f32>,
    active_count: u32,
    dirty: bool,
}

impl ArrayUniform {
    fn new(ty: ElementType, capacity: u32) -> Self {
        let comps = component_count(ty);
        let padded = padded_components_per_element(ty);
        Self {
            ty,
            capacity,
            tight: vec![0.0; comps * capacity as usize],
            padded: vec![0.0; padded * capacity as usize],
            active_count: capacity,
            dirty: true,
        }
    }

    pub fn element_type(&self) -> ElementType {
        self.ty
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Elements written by the most recent `set_array`.
    pub fn active_count(&self) -> u32 {
        self.active_count
    }

    /// Padded std140 bytes covering the full declared capacity.
    pub fn padded_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.padded)
    }

    fn write(&mut self, data: &[f32]) {
        let comps = component_count(self.ty);
        self.active_count = (data.len() / comps) as u32;
        self.tight.fill(0.0);
        self.tight[..data.len()].copy_from_slice(data);
        // write_padded zero-fills, so the tail beyond the active prefix
        // reads zero on the GPU.
        write_padded(self.ty, &self.tight, &mut self.padded);
        self.dirty = true;
    }
}

/// Owns every declared custom uniform, its current value, and its dirty
/// state between frames.
#[derive(Debug, Clone, Default)]
pub struct UniformStore {
    layout: Std140Layout,
    scalars: BTreeMap<String, ScalarSlot>,
    arrays: BTreeMap<String, ArrayUniform>,
    mirror: Vec<f32>,
    scalars_dirty: bool,
}

impl UniformStore {
    pub fn from_decls(decls: &BTreeMap<String, UniformDecl>) -> Self {
        let mut scalars = BTreeMap::new();
        let mut arrays = BTreeMap::new();
        for (name, decl) in decls {
            match decl {
                UniformDecl::Scalar { ty, default, .. } => {
                    let value = UniformValue::from_default(*ty, default.as_ref());
                    scalars.insert(
                        name.clone(),
                        ScalarSlot {
                            ty: *ty,
                            value,
                            default: value,
                        },
                    );
                }
                UniformDecl::Array { ty, count } => {
                    arrays.insert(name.clone(), ArrayUniform::new(*ty, *count));
                }
            }
        }

        // Scalars in name order, then one count member per array. The source
        // builder declares block members from this same layout.
        let members = scalars
            .iter()
            .map(|(name, slot)| (name.clone(), slot.ty))
            .chain(
                arrays
                    .keys()
                    .map(|name| (format!("{name}_count"), ScalarType::Int)),
            );
        let layout = Std140Layout::new(members);

        let mut store = Self {
            mirror: vec![0.0; layout.size_floats()],
            layout,
            scalars,
            arrays,
            scalars_dirty: true,
        };
        store.rewrite_mirror();
        store
    }

    pub fn layout(&self) -> &Std140Layout {
        &self.layout
    }

    /// Sets a scalar uniform. Unknown names and type mismatches are
    /// rejected with a warning.
    pub fn set_uniform(&mut self, name: &str, value: UniformValue) {
        let Some(slot) = self.scalars.get_mut(name) else {
            tracing::warn!(name, "set_uniform: no scalar uniform with this name");
            return;
        };
        if value.scalar_type() != slot.ty {
            tracing::warn!(
                name,
                expected = ?slot.ty,
                got = ?value.scalar_type(),
                "set_uniform: type mismatch, value ignored"
            );
            return;
        }
        slot.value = value;
        let size = slot.ty.components();
        if let Some(offset) = self.layout.offset(name) {
            let comps = value.components();
            self.mirror[offset..offset + size].copy_from_slice(&comps[..size]);
        }
        self.scalars_dirty = true;
    }

    pub fn get_uniform(&self, name: &str) -> Option<UniformValue> {
        self.scalars.get(name).map(|slot| slot.value)
    }

    /// Replaces the leading elements of an array uniform with `data`
    /// (tightly packed). The remainder is zeroed and the array's count
    /// member updates to the number of elements written.
    pub fn set_array(&mut self, name: &str, data: &[f32]) {
        let Some(array) = self.arrays.get_mut(name) else {
            tracing::warn!(name, "set_array: no array uniform with this name");
            return;
        };
        let comps = component_count(array.ty);
        if data.len() % comps != 0 {
            tracing::warn!(
                name,
                len = data.len(),
                element_components = comps,
                "set_array: data length is not a whole number of elements, ignored"
            );
            return;
        }
        let elements = (data.len() / comps) as u32;
        if elements > array.capacity {
            tracing::warn!(
                name,
                elements,
                capacity = array.capacity,
                "set_array: more elements than the declared capacity, ignored"
            );
            return;
        }
        array.write(data);

        if let Some(count_offset) = self.layout.offset(&format!("{name}_count")) {
            self.mirror[count_offset] = elements as f32;
        }
        self.scalars_dirty = true;
    }

    /// Tight copy of the active prefix of an array uniform.
    pub fn get_array(&self, name: &str) -> Option<&[f32]> {
        self.arrays.get(name).map(|array| {
            let comps = component_count(array.ty);
            &array.tight[..array.active_count as usize * comps]
        })
    }

    pub fn array(&self, name: &str) -> Option<&ArrayUniform> {
        self.arrays.get(name)
    }

    pub fn arrays(&self) -> impl Iterator<Item = (&str, &ArrayUniform)> {
        self.arrays.iter().map(|(name, array)| (name.as_str(), array))
    }

    /// Restores one scalar uniform to its declared default.
    pub fn reset_uniform(&mut self, name: &str) {
        match self.scalars.get(name).map(|slot| slot.default) {
            Some(default) => self.set_uniform(name, default),
            None => tracing::warn!(name, "reset_uniform: no scalar uniform with this name"),
        }
    }

    /// Restores every uniform to its declared default.
    pub fn reset_to_defaults(&mut self) {
        let defaults: Vec<(String, UniformValue)> = self
            .scalars
            .iter()
            .map(|(name, slot)| (name.clone(), slot.default))
            .collect();
        for (name, default) in defaults {
            self.set_uniform(&name, default);
        }
        let names: Vec<String> = self.arrays.keys().cloned().collect();
        for name in names {
            let capacity_floats = {
                let array = &self.arrays[&name];
                component_count(array.ty) * array.capacity as usize
            };
            self.set_array(&name, &vec![0.0; capacity_floats]);
        }
    }

    /// std140 bytes of the scalar block mirror.
    pub fn scalar_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.mirror)
    }

    pub fn scalars_dirty(&self) -> bool {
        self.scalars_dirty
    }

    pub fn array_dirty(&self, name: &str) -> bool {
        self.arrays.get(name).map(|a| a.dirty).unwrap_or(false)
    }

    /// Clears all dirty flags; called after a frame uploads its data.
    pub fn clear_dirty(&mut self) {
        self.scalars_dirty = false;
        for array in self.arrays.values_mut() {
            array.dirty = false;
        }
    }

    /// Forces a full re-upload on the next frame, used after pipelines are
    /// rebuilt and their buffers recreated.
    pub fn mark_all_dirty(&mut self) {
        self.scalars_dirty = true;
        for array in self.arrays.values_mut() {
            array.dirty = true;
        }
    }

    fn rewrite_mirror(&mut self) {
        self.mirror.fill(0.0);
        let writes: Vec<(usize, UniformValue, usize)> = self
            .scalars
            .iter()
            .filter_map(|(name, slot)| {
                self.layout
                    .offset(name)
                    .map(|offset| (offset, slot.value, slot.ty.components()))
            })
            .collect();
        for (offset, value, size) in writes {
            self.mirror[offset..offset + size].copy_from_slice(&value.components()[..size]);
        }
        let counts: Vec<(usize, f32)> = self
            .arrays
            .iter()
            .filter_map(|(name, array)| {
                self.layout
                    .offset(&format!("{name}_count"))
                    .map(|offset| (offset, array.active_count as f32))
            })
            .collect();
        for (offset, count) in counts {
            self.mirror[offset] = count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decls() -> BTreeMap<String, UniformDecl> {
        let mut decls = BTreeMap::new();
        decls.insert(
            "speed".to_string(),
            UniformDecl::Scalar {
                ty: ScalarType::Float,
                default: Some(DefaultValue::Number(2.0)),
                range: None,
            },
        );
        decls.insert(
            "tint".to_string(),
            UniformDecl::Scalar {
                ty: ScalarType::Vec3,
                default: Some(DefaultValue::Vector(vec![1.0, 0.5, 0.25])),
                range: None,
            },
        );
        decls.insert(
            "enabled".to_string(),
            UniformDecl::Scalar {
                ty: ScalarType::Bool,
                default: Some(DefaultValue::Bool(true)),
                range: None,
            },
        );
        decls.insert(
            "points".to_string(),
            UniformDecl::Array {
                ty: ElementType::Vec3,
                count: 8,
            },
        );
        decls
    }

    #[test]
    fn defaults_land_in_mirror() {
        let store = UniformStore::from_decls(&decls());
        assert_eq!(store.get_uniform("speed"), Some(UniformValue::Float(2.0)));
        assert_eq!(
            store.get_uniform("tint"),
            Some(UniformValue::Vec3([1.0, 0.5, 0.25]))
        );
        let offset = store.layout().offset("speed").unwrap();
        let floats: &[f32] = bytemuck::cast_slice(store.scalar_bytes());
        assert_eq!(floats[offset], 2.0);
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let mut store = UniformStore::from_decls(&decls());
        store.set_uniform("speed", UniformValue::Vec2([1.0, 2.0]));
        assert_eq!(store.get_uniform("speed"), Some(UniformValue::Float(2.0)));
        store.set_uniform("missing", UniformValue::Float(1.0));
        assert_eq!(store.get_uniform("missing"), None);
    }

    #[test]
    fn array_set_updates_count_and_zeroes_tail() {
        let mut store = UniformStore::from_decls(&decls());
        store.set_array("points", &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let array = store.array("points").unwrap();
        assert_eq!(array.active_count(), 2);
        let padded: &[f32] = bytemuck::cast_slice(array.padded_bytes());
        assert_eq!(&padded[0..3], &[1.0, 2.0, 3.0]);
        assert_eq!(padded[3], 0.0);
        assert_eq!(&padded[4..7], &[4.0, 5.0, 6.0]);
        // Everything past the active prefix stays zero.
        assert!(padded[8..].iter().all(|&v| v == 0.0));

        let count_offset = store.layout().offset("points_count").unwrap();
        let floats: &[f32] = bytemuck::cast_slice(store.scalar_bytes());
        assert_eq!(floats[count_offset], 2.0);
    }

    #[test]
    fn array_overflow_is_rejected() {
        let mut store = UniformStore::from_decls(&decls());
        store.set_array("points", &[0.5; 3]);
        store.set_array("points", &vec![9.0; 3 * 9]);
        let array = store.array("points").unwrap();
        assert_eq!(array.active_count(), 1);
        assert_eq!(store.get_array("points").unwrap(), &[0.5, 0.5, 0.5]);
    }

    #[test]
    fn ragged_length_is_rejected() {
        let mut store = UniformStore::from_decls(&decls());
        store.set_array("points", &[1.0, 2.0]);
        assert_eq!(store.array("points").unwrap().active_count(), 8);
    }

    #[test]
    fn dirty_tracking_round_trip() {
        let mut store = UniformStore::from_decls(&decls());
        store.clear_dirty();
        assert!(!store.scalars_dirty());
        assert!(!store.array_dirty("points"));

        store.set_uniform("speed", UniformValue::Float(4.0));
        assert!(store.scalars_dirty());
        store.set_array("points", &[0.0; 3]);
        assert!(store.array_dirty("points"));

        store.clear_dirty();
        assert!(!store.scalars_dirty());
        store.mark_all_dirty();
        assert!(store.scalars_dirty() && store.array_dirty("points"));
    }

    #[test]
    fn reset_restores_defaults() {
        let mut store = UniformStore::from_decls(&decls());
        store.set_uniform("speed", UniformValue::Float(10.0));
        store.set_uniform("enabled", UniformValue::Bool(false));
        store.reset_uniform("speed");
        assert_eq!(store.get_uniform("speed"), Some(UniformValue::Float(2.0)));
        assert_eq!(store.get_uniform("enabled"), Some(UniformValue::Bool(false)));
        store.reset_to_defaults();
        assert_eq!(store.get_uniform("enabled"), Some(UniformValue::Bool(true)));
    }
}
