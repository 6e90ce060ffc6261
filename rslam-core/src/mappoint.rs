use sophus::nalgebra::Vector3;

use crate::Id;

/// A 3D point (or 2D bearing candidate) observed by one or more keyframes.
///
/// Identified by the id of the keypoint that first observed it
/// (`spec.md` §3). The observer list's first entry is always the oldest
/// surviving observer and therefore the canonical reference frame for this
/// point's position.
#[derive(Debug, Clone)]
pub struct MapPoint {
    pub id: Id,
    pub world: Vector3<f64>,
    pub is_3d: bool,
    pub observers: Vec<Id>,
    pub descriptor: Option<Vec<u8>>,
}

impl MapPoint {
    /// Creates a fresh 2D (bearing-only) map point observed by `kfid`.
    pub fn new_2d(id: Id, kfid: Id) -> Self {
        Self {
            id,
            world: Vector3::zeros(),
            is_3d: false,
            observers: vec![kfid],
            descriptor: None,
        }
    }

    pub fn first_observer(&self) -> Option<Id> {
        self.observers.first().copied()
    }

    pub fn add_observer(&mut self, kfid: Id) {
        if !self.observers.contains(&kfid) {
            self.observers.push(kfid);
        }
    }

    /// Removes one observer link. Returns `true` if the observer list is
    /// now empty and the point should be deleted by the caller.
    pub fn remove_observer(&mut self, kfid: Id) -> bool {
        self.observers.retain(|&o| o != kfid);
        self.observers.is_empty()
    }

    pub fn promote(&mut self, world: Vector3<f64>) {
        self.world = world;
        self.is_3d = true;
    }
}
