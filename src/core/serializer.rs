// Static constant serializers emitted once per chunk so every chunk is self-describing.
use crate::core::relation::{
    RelationWriter, TYPE_THREAD_GROUP, TYPE_THREAD_STATE, TypeId, ValueWriter,
};
use crate::core::thread::{VIRTUAL_GROUP_ID, VIRTUAL_GROUP_NAME};

pub trait Serializer: Send + Sync {
    fn type_id(&self) -> TypeId;

    fn serialize(&self, relation: &mut RelationWriter);
}

pub const THREAD_STATES: [&str; 6] = [
    "STATE_NEW",
    "STATE_RUNNABLE",
    "STATE_BLOCKED",
    "STATE_WAITING",
    "STATE_TIMED_WAITING",
    "STATE_TERMINATED",
];

pub struct ThreadStateSerializer;

impl Serializer for ThreadStateSerializer {
    fn type_id(&self) -> TypeId {
        TYPE_THREAD_STATE
    }

    fn serialize(&self, relation: &mut RelationWriter) {
        for (key, name) in THREAD_STATES.iter().enumerate() {
            relation.add(key as u64, &ValueWriter::new().str(name).finish());
        }
    }
}

/// The group every virtual thread refers to; simplified checkpoints rely on it.
pub struct VirtualThreadGroupSerializer;

impl Serializer for VirtualThreadGroupSerializer {
    fn type_id(&self) -> TypeId {
        TYPE_THREAD_GROUP
    }

    fn serialize(&self, relation: &mut RelationWriter) {
        relation.add(
            VIRTUAL_GROUP_ID,
            &ValueWriter::new().u64(0).str(VIRTUAL_GROUP_NAME).finish(),
        );
    }
}

/// Closure-backed serializer for callers registering their own static types.
pub struct FnSerializer<F> {
    type_id: TypeId,
    f: F,
}

impl<F> FnSerializer<F>
where
    F: Fn(&mut RelationWriter) + Send + Sync,
{
    pub fn new(type_id: TypeId, f: F) -> Self {
        Self { type_id, f }
    }
}

impl<F> Serializer for FnSerializer<F>
where
    F: Fn(&mut RelationWriter) + Send + Sync,
{
    fn type_id(&self) -> TypeId {
        self.type_id
    }

    fn serialize(&self, relation: &mut RelationWriter) {
        (self.f)(relation)
    }
}

#[cfg(test)]
mod tests {
    use super::{FnSerializer, Serializer, THREAD_STATES, ThreadStateSerializer};
    use crate::core::relation::{FIRST_USER_TYPE, RelationWriter};

    #[test]
    fn thread_states_cover_every_state() {
        let serializer = ThreadStateSerializer;
        let mut relation = RelationWriter::new(serializer.type_id());
        serializer.serialize(&mut relation);
        assert_eq!(relation.count() as usize, THREAD_STATES.len());
    }

    #[test]
    fn fn_serializer_delegates() {
        let serializer = FnSerializer::new(FIRST_USER_TYPE, |relation: &mut RelationWriter| {
            relation.add(1, b"gc-young");
            relation.add(2, b"gc-old");
        });
        let mut relation = RelationWriter::new(serializer.type_id());
        serializer.serialize(&mut relation);
        assert_eq!(relation.count(), 2);
        assert_eq!(relation.type_id(), FIRST_USER_TYPE);
    }
}
