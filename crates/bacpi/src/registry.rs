//! Point Registry
//!
//! Owns every active [`Point`], keyed by identifier. Registration is
//! monotonic: points are never removed while the process runs, so an accepted
//! identifier stays claimed until restart. The device's own identifier is
//! claimed at construction.

use std::collections::HashMap;

use crate::point::{Point, PointIdentifier, Role};

/// Errors that can occur when registering a point
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Duplicate identifier: {0}")]
    DuplicateIdentifier(PointIdentifier),
}

/// Authoritative collection of active points
#[derive(Debug)]
pub struct Registry {
    /// Reserved identifier of the device object
    device: PointIdentifier,
    points: HashMap<PointIdentifier, Point>,
}

impl Registry {
    /// Create an empty registry for the given device instance
    pub fn new(device_instance: u32) -> Self {
        Self {
            device: PointIdentifier::device(device_instance),
            points: HashMap::new(),
        }
    }

    pub fn device_id(&self) -> PointIdentifier {
        self.device
    }

    /// Whether `id` is already claimed, including by the device itself
    pub fn contains(&self, id: &PointIdentifier) -> bool {
        *id == self.device || self.points.contains_key(id)
    }

    /// Insert a point if its identifier is unused.
    ///
    /// On conflict the point is dropped and the existing entry is untouched.
    pub fn add(&mut self, point: Point) -> Result<(), RegistryError> {
        if self.contains(&point.id) {
            return Err(RegistryError::DuplicateIdentifier(point.id));
        }
        tracing::debug!(object = %point.id, name = %point.name, "Registered point");
        self.points.insert(point.id, point);
        Ok(())
    }

    pub fn lookup(&self, id: &PointIdentifier) -> Option<&Point> {
        self.points.get(id)
    }

    pub fn lookup_mut(&mut self, id: &PointIdentifier) -> Option<&mut Point> {
        self.points.get_mut(id)
    }

    /// Iterate over the points playing `role`
    pub fn iter_by_role(&self, role: Role) -> impl Iterator<Item = &Point> {
        self.points.values().filter(move |p| p.role() == role)
    }

    /// Identifiers of the points playing `role`, sorted for a stable pass order
    pub fn ids_by_role(&self, role: Role) -> Vec<PointIdentifier> {
        let mut ids: Vec<_> = self.iter_by_role(role).map(|p| p.id).collect();
        ids.sort();
        ids
    }

    /// The mode-governing point, if one is registered.
    ///
    /// With several, the lowest identifier wins.
    pub fn mode_point(&self) -> Option<&Point> {
        self.iter_by_role(Role::Mode).min_by_key(|p| p.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Point> {
        self.points.values()
    }

    /// Number of points, not counting the device object
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
