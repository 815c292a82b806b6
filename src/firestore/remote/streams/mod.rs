pub mod listen;
pub mod write;

pub use listen::{
    DocumentChange, DocumentDelete, DocumentRemove, ExistenceFilter, ListenErrorCause,
    ListenResponse, ListenStream, ListenStreamDelegate, ListenTarget, ListenTargetChange,
    TargetChangeState, TargetPayload,
};
pub use write::{WriteResponse, WriteResult, WriteStream, WriteStreamDelegate};
