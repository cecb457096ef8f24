use super::drawing::{DrawingSet, MergedView};

/// Combines a root drawing and its sub-drawings into one resolved view.
pub trait DrawingMerger: Send + Sync {
    fn merge(&self, set: &DrawingSet) -> MergedView;
}

/// Root first; when two drawings claim the same handle the earlier one wins.
/// Unindexed items are concatenated in drawing order.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultMerger;

impl DrawingMerger for DefaultMerger {
    fn merge(&self, set: &DrawingSet) -> MergedView {
        let mut merged = MergedView::default();
        for name in set.list_drawings() {
            let Some(drawing) = set.drawing(name) else {
                continue;
            };
            merged.unindexed.extend(drawing.unindexed.iter().cloned());
            for (idx, item) in &drawing.indexed {
                merged.indexed.entry(*idx).or_insert_with(|| item.clone());
            }
            for (cmd, item) in &drawing.zones {
                merged.zones.entry(cmd.clone()).or_insert_with(|| item.clone());
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::drawing::{DrawingItem, DrawingUpdate, InsertPlacement, Transform};
    use serde_json::json;

    #[test]
    fn root_wins_handle_collisions() {
        let mut set = DrawingSet::new();
        set.set_root("main");
        set.add_sub_drawing(
            "sub",
            InsertPlacement {
                parent: "main".into(),
                offset: (1.0, 1.0),
                transform: Transform::default(),
            },
        );
        let items = |label: &str| {
            vec![
                DrawingItem::from_value(&json!({"type": "label", "idx": 1, "text": label}))
                    .unwrap(),
                DrawingItem::from_value(&json!({"type": "line", "text": label})).unwrap(),
            ]
        };
        for name in ["main", "sub"] {
            set.write(
                name,
                DrawingUpdate {
                    full: true,
                    items: items(name),
                    ..DrawingUpdate::default()
                },
            )
            .unwrap();
        }

        let merged = DefaultMerger.merge(&set);
        assert_eq!(merged.indexed[&1].props["text"], "main");
        let order: Vec<_> = merged
            .unindexed
            .iter()
            .map(|item| item.props["text"].as_str().unwrap())
            .collect();
        assert_eq!(order, ["main", "sub"]);
    }
}
