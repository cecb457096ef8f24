use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tracing::warn;

use crate::error::FoldError;
use crate::protocol::ParsedResponse;

const INSERT_ITEM: &str = "insertDwg";
const TOUCH_ZONE_ITEM: &str = "touchZone";

#[derive(Debug, Clone, PartialEq)]
pub struct DrawingItem {
    pub kind: String,
    /// Stable handle for indexed items.
    pub idx: Option<u32>,
    /// Command handle for touch zones.
    pub cmd: Option<String>,
    pub props: Value,
}

impl DrawingItem {
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let kind = object
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let idx = object
            .get("idx")
            .and_then(Value::as_u64)
            .filter(|idx| *idx > 0)
            .and_then(|idx| u32::try_from(idx).ok());
        let cmd = object
            .get("cmd")
            .and_then(Value::as_str)
            .filter(|_| kind == TOUCH_ZONE_ITEM)
            .map(str::to_string);
        Some(Self {
            kind,
            idx,
            cmd,
            props: value.clone(),
        })
    }

    pub fn is_zone(&self) -> bool {
        self.cmd.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub x: f64,
    pub y: f64,
    pub scale: f64,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            scale: 1.0,
        }
    }
}

/// Where a sub-drawing sits inside its parent.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertPlacement {
    pub parent: String,
    pub offset: (f64, f64),
    pub transform: Transform,
}

/// An `insertDwg` reference found while decoding a response.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertRef {
    pub name: String,
    pub offset: (f64, f64),
    pub transform: Transform,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrawingMeta {
    pub version: Option<String>,
    pub refresh_ms: u64,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub color: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Drawing {
    pub name: String,
    /// `None` until the first response for this drawing has been written.
    pub meta: Option<DrawingMeta>,
    pub unindexed: Vec<DrawingItem>,
    pub indexed: BTreeMap<u32, DrawingItem>,
    pub zones: BTreeMap<String, DrawingItem>,
    pub placement: Option<InsertPlacement>,
}

impl Drawing {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            meta: None,
            unindexed: Vec::new(),
            indexed: BTreeMap::new(),
            zones: BTreeMap::new(),
            placement: None,
        }
    }

    pub fn has_data(&self) -> bool {
        self.meta.is_some()
    }
}

/// Everything one response contributes to a drawing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrawingUpdate {
    pub full: bool,
    pub version: Option<String>,
    pub refresh_ms: Option<u64>,
    pub size: Option<(f64, f64)>,
    pub color: Option<Value>,
    pub items: Vec<DrawingItem>,
    pub inserts: Vec<InsertRef>,
}

/// Addressable items of the whole drawing-set resolved into one view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedView {
    pub unindexed: Vec<DrawingItem>,
    pub indexed: BTreeMap<u32, DrawingItem>,
    pub zones: BTreeMap<String, DrawingItem>,
}

impl MergedView {
    fn apply(&mut self, items: &[DrawingItem]) {
        for item in items {
            place_item(&mut self.unindexed, &mut self.indexed, &mut self.zones, item);
        }
    }
}

fn place_item(
    unindexed: &mut Vec<DrawingItem>,
    indexed: &mut BTreeMap<u32, DrawingItem>,
    zones: &mut BTreeMap<String, DrawingItem>,
    item: &DrawingItem,
) {
    if let Some(cmd) = &item.cmd {
        zones.insert(cmd.clone(), item.clone());
    } else if let Some(idx) = item.idx {
        indexed.insert(idx, item.clone());
    } else {
        unindexed.push(item.clone());
    }
}

/// A root drawing plus the sub-drawings it inserts, keyed by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrawingSet {
    order: Vec<String>,
    drawings: HashMap<String, Drawing>,
    merged: MergedView,
}

impl DrawingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_name(&self) -> Option<&str> {
        self.order.first().map(String::as_str)
    }

    /// Root first, then sub-drawings in insertion order.
    pub fn list_drawings(&self) -> &[String] {
        &self.order
    }

    pub fn contains(&self, name: &str) -> bool {
        self.order.iter().any(|entry| entry == name)
    }

    pub fn drawing(&self, name: &str) -> Option<&Drawing> {
        self.drawings.get(name)
    }

    pub fn version(&self, name: &str) -> Option<&str> {
        self.drawings
            .get(name)
            .and_then(|drawing| drawing.meta.as_ref())
            .and_then(|meta| meta.version.as_deref())
    }

    pub fn has_data(&self, name: &str) -> bool {
        self.drawings.get(name).is_some_and(Drawing::has_data)
    }

    /// Refresh interval advertised by the root drawing, zero when unknown.
    pub fn refresh_ms(&self) -> u64 {
        self.current_name()
            .and_then(|name| self.drawings.get(name))
            .and_then(|drawing| drawing.meta.as_ref())
            .map(|meta| meta.refresh_ms)
            .unwrap_or(0)
    }

    pub fn merged(&self) -> &MergedView {
        &self.merged
    }

    pub fn set_merged(&mut self, merged: MergedView) {
        self.merged = merged;
    }

    /// Item collections for `name` exist after this call.
    pub fn ensure_collections(&mut self, name: &str) -> &mut Drawing {
        self.drawings
            .entry(name.to_string())
            .or_insert_with(|| Drawing::new(name))
    }

    /// Makes `name` the root. Switching to a different root drops the old
    /// tree but keeps any data already held for `name`.
    pub fn set_root(&mut self, name: &str) {
        if self.current_name() == Some(name) {
            return;
        }
        let kept = self.drawings.remove(name);
        self.drawings.clear();
        self.order.clear();
        self.merged = MergedView::default();
        let mut root = kept.unwrap_or_else(|| Drawing::new(name));
        root.placement = None;
        self.drawings.insert(name.to_string(), root);
        self.order.push(name.to_string());
    }

    /// Returns false when `name` was already listed.
    pub fn add_sub_drawing(&mut self, name: &str, placement: InsertPlacement) -> bool {
        if self.contains(name) {
            return false;
        }
        self.ensure_collections(name).placement = Some(placement);
        self.order.push(name.to_string());
        true
    }

    pub fn child_drawings(&self, parent: &str) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| {
                self.drawings
                    .get(name.as_str())
                    .and_then(|drawing| drawing.placement.as_ref())
                    .is_some_and(|placement| placement.parent == parent)
            })
            .cloned()
            .collect()
    }

    /// Removes a sub-drawing and, recursively, every drawing it inserted.
    /// Returns the names removed; the root cannot be removed this way.
    pub fn remove_sub_drawing(&mut self, name: &str) -> Vec<String> {
        if self.current_name() == Some(name) || !self.contains(name) {
            return Vec::new();
        }
        let mut removed = Vec::new();
        let mut pending = vec![name.to_string()];
        while let Some(next) = pending.pop() {
            if removed.contains(&next) {
                continue;
            }
            pending.extend(self.child_drawings(&next));
            self.order.retain(|entry| entry != &next);
            self.drawings.remove(&next);
            removed.push(next);
        }
        removed
    }

    /// Puts back an earlier copy of a listed drawing. Returns false when the
    /// drawing is no longer part of the set.
    pub fn restore_drawing(&mut self, drawing: Drawing) -> bool {
        if !self.contains(&drawing.name) {
            return false;
        }
        self.drawings.insert(drawing.name.clone(), drawing);
        true
    }

    /// Writes one decoded response into drawing `name` and returns the
    /// sub-drawing references it carried.
    pub fn write(
        &mut self,
        name: &str,
        update: DrawingUpdate,
    ) -> Result<Vec<InsertRef>, FoldError> {
        let drawing = self
            .drawings
            .get_mut(name)
            .ok_or_else(|| FoldError::UnknownDrawing(name.to_string()))?;

        let meta = drawing.meta.get_or_insert_with(DrawingMeta::default);
        if update.version.is_some() {
            meta.version = update.version;
        }
        if let Some(refresh) = update.refresh_ms {
            meta.refresh_ms = refresh;
        }
        if let Some((width, height)) = update.size {
            meta.width = Some(width);
            meta.height = Some(height);
        }
        if update.color.is_some() {
            meta.color = update.color;
        }

        if update.full {
            drawing.unindexed.clear();
            drawing.indexed.clear();
            drawing.zones.clear();
        }
        let mut fresh_unindexed = Vec::new();
        for item in &update.items {
            place_item(
                &mut fresh_unindexed,
                &mut drawing.indexed,
                &mut drawing.zones,
                item,
            );
        }
        // Unindexed items are only ever resent as a complete list.
        if update.full || !fresh_unindexed.is_empty() {
            drawing.unindexed = fresh_unindexed;
        }
        Ok(update.inserts)
    }

    /// Applies items straight onto the merged view, leaving individual
    /// drawings untouched.
    pub fn write_merged(&mut self, update: &DrawingUpdate) {
        self.merged.apply(&update.items);
    }
}

/// Turns a drawing-shaped response into a [`DrawingUpdate`].
pub trait DrawingDecoder: Send + Sync {
    fn decode(&self, name: &str, response: &ParsedResponse) -> Result<DrawingUpdate, FoldError>;
}

/// Decodes the `items` array of JSON responses.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonItemDecoder;

impl DrawingDecoder for JsonItemDecoder {
    fn decode(&self, name: &str, response: &ParsedResponse) -> Result<DrawingUpdate, FoldError> {
        let raw = &response.raw;
        let mut update = DrawingUpdate {
            full: response.is_snapshot(),
            version: raw.version.clone().filter(|version| version != "null"),
            refresh_ms: raw.refresh,
            size: raw.x.zip(raw.y),
            color: raw.color.clone(),
            ..DrawingUpdate::default()
        };

        for value in &raw.items {
            let item = DrawingItem::from_value(value).ok_or_else(|| FoldError::Decode {
                name: name.to_string(),
                reason: format!("item is not an object: {value}"),
            })?;
            if item.kind.eq_ignore_ascii_case(INSERT_ITEM) {
                match insert_ref(value) {
                    Some(insert) => update.inserts.push(insert),
                    None => warn!(
                        target: "pfod::session",
                        drawing = %name,
                        "insertDwg item without drawingName"
                    ),
                }
            }
            update.items.push(item);
        }
        Ok(update)
    }
}

fn insert_ref(value: &Value) -> Option<InsertRef> {
    let name = value
        .get("drawingName")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())?;
    let number = |key: &str| value.get(key).and_then(Value::as_f64).unwrap_or(0.0);
    let transform = value
        .get("transform")
        .map(|transform| Transform {
            x: transform.get("x").and_then(Value::as_f64).unwrap_or(0.0),
            y: transform.get("y").and_then(Value::as_f64).unwrap_or(0.0),
            scale: transform.get("scale").and_then(Value::as_f64).unwrap_or(1.0),
        })
        .unwrap_or_default();
    Some(InsertRef {
        name: name.to_string(),
        offset: (number("xOffset"), number("yOffset")),
        transform,
    })
}
