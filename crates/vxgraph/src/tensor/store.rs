use super::{TensorAttr, TensorDescriptor, TensorError, TensorId};

/// Owns every tensor descriptor of a graph, including internal ones.
///
/// Slots are never reused, so a stale id keeps failing lookups after removal.
#[derive(Debug, Default)]
pub struct TensorStore {
    slots: Vec<Option<TensorDescriptor>>,
}

impl TensorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, attr: TensorAttr) -> TensorId {
        let id = TensorId(self.slots.len() as u32);
        self.slots.push(Some(TensorDescriptor::new(id, attr)));
        id
    }

    pub fn get(&self, id: TensorId) -> Result<&TensorDescriptor, TensorError> {
        self.slots
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(TensorError::Unknown(id))
    }

    pub fn get_mut(&mut self, id: TensorId) -> Result<&mut TensorDescriptor, TensorError> {
        self.slots
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(TensorError::Unknown(id))
    }

    pub fn contains(&self, id: TensorId) -> bool {
        self.get(id).is_ok()
    }

    pub fn remove(&mut self, id: TensorId) -> Result<TensorDescriptor, TensorError> {
        self.slots
            .get_mut(id.0 as usize)
            .and_then(Option::take)
            .ok_or(TensorError::Unknown(id))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &TensorDescriptor> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TensorDescriptor> {
        self.slots.iter_mut().filter_map(Option::as_mut)
    }
}
