//! Drawing-set model shared by the visible view and session workspaces.

pub mod drawing;
pub mod merge;

pub use drawing::{
    Drawing, DrawingDecoder, DrawingItem, DrawingMeta, DrawingSet, DrawingUpdate, InsertPlacement,
    InsertRef, JsonItemDecoder, MergedView, Transform,
};
pub use merge::{DefaultMerger, DrawingMerger};
