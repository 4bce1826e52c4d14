//! Pluggable sort strategy applied to query results at read time.
//!
//! Modeled as a plain value type (field + direction) with a pure comparison
//! function; toggling is explicit and the active order is never stored in
//! the cache.

use std::cmp::Ordering;

use serde_json::Value;

use crate::{path, timefmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Name,
    Age,
}

/// Current sort selection. `ascending` flips the field's base order:
/// names A→Z, ages newest-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sorter {
    pub field: SortField,
    pub ascending: bool,
}

impl Default for Sorter {
    fn default() -> Self {
        Self { field: SortField::Name, ascending: true }
    }
}

impl Sorter {
    /// Select a field. Re-selecting the current field flips the direction;
    /// switching fields resets to ascending.
    pub fn select(&mut self, field: SortField) {
        if self.field == field {
            self.ascending = !self.ascending;
        } else {
            self.field = field;
            self.ascending = true;
        }
    }

    pub fn toggle_direction(&mut self) {
        self.ascending = !self.ascending;
    }

    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        let base = match self.field {
            SortField::Name => cmp_by_name(a, b),
            SortField::Age => cmp_by_age(a, b),
        };
        if self.ascending {
            base
        } else {
            base.reverse()
        }
    }

    /// Sort a snapshot in place. The sort is stable, so items that compare
    /// equal keep their positional order.
    pub fn sort(&self, items: &mut [Value]) {
        items.sort_by(|a, b| self.compare(a, b));
    }
}

fn name_of(v: &Value) -> &str {
    path::str_at(v, &["metadata", "name"]).unwrap_or("")
}

/// Unnamed items sort after named ones; among themselves they compare
/// equal, so the stable sort keeps their positional order. Treating a
/// named-vs-unnamed pair as equal would break transitivity.
fn cmp_by_name(a: &Value, b: &Value) -> Ordering {
    let (an, bn) = (name_of(a), name_of(b));
    match (an.is_empty(), bn.is_empty()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => an.cmp(bn),
    }
}

/// Newest first. Items with a missing or unparseable creationTimestamp
/// fall back to name order.
fn cmp_by_age(a: &Value, b: &Value) -> Ordering {
    let ta = path::str_at(a, &["metadata", "creationTimestamp"]).and_then(timefmt::parse_timestamp);
    let tb = path::str_at(b, &["metadata", "creationTimestamp"]).and_then(timefmt::parse_timestamp);
    match (ta, tb) {
        (Some(ta), Some(tb)) => tb.cmp(&ta),
        _ => cmp_by_name(a, b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn named(name: &str) -> Value {
        json!({"metadata": {"name": name}})
    }

    fn aged(name: &str, ts: &str) -> Value {
        json!({"metadata": {"name": name, "creationTimestamp": ts}})
    }

    #[test]
    fn name_sort_is_lexicographic() {
        let mut items = vec![named("c"), named("a"), named("b")];
        Sorter::default().sort(&mut items);
        let names: Vec<_> = items.iter().map(|v| name_of(v).to_string()).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn descending_reverses_and_double_toggle_restores() {
        let mut sorter = Sorter::default();
        let mut items = vec![named("a"), named("b")];
        sorter.toggle_direction();
        sorter.sort(&mut items);
        assert_eq!(name_of(&items[0]), "b");
        sorter.toggle_direction();
        sorter.sort(&mut items);
        assert_eq!(name_of(&items[0]), "a");
    }

    #[test]
    fn age_sort_is_newest_first() {
        let mut sorter = Sorter::default();
        sorter.select(SortField::Age);
        let mut items = vec![
            aged("old", "2020-01-01T00:00:00Z"),
            aged("new", "2024-06-01T12:00:00Z"),
            aged("mid", "2022-03-15T08:30:00Z"),
        ];
        sorter.sort(&mut items);
        let names: Vec<_> = items.iter().map(|v| name_of(v).to_string()).collect();
        assert_eq!(names, ["new", "mid", "old"]);
    }

    #[test]
    fn age_sort_falls_back_to_name_for_missing_timestamps() {
        let mut sorter = Sorter::default();
        sorter.select(SortField::Age);
        let mut items = vec![named("zed"), named("abe")];
        sorter.sort(&mut items);
        assert_eq!(name_of(&items[0]), "abe");
    }

    #[test]
    fn unnamed_items_sort_last_in_arrival_order() {
        let first = json!({"metadata": {"uid": "1"}});
        let second = json!({"metadata": {"uid": "2"}});
        let mut items = vec![first.clone(), named("m"), second.clone()];
        Sorter::default().sort(&mut items);
        assert_eq!(name_of(&items[0]), "m");
        assert_eq!(items[1], first);
        assert_eq!(items[2], second);
    }

    #[test]
    fn unnamed_item_does_not_disturb_named_order() {
        let mut items = vec![named("z"), json!({"metadata": {"uid": "1"}}), named("a")];
        Sorter::default().sort(&mut items);
        let names: Vec<_> = items.iter().map(|v| name_of(v).to_string()).collect();
        assert_eq!(names, ["a", "z", ""]);
    }

    #[test]
    fn reselecting_field_flips_switching_resets() {
        let mut sorter = Sorter::default();
        sorter.select(SortField::Name);
        assert!(!sorter.ascending);
        sorter.select(SortField::Age);
        assert_eq!(sorter.field, SortField::Age);
        assert!(sorter.ascending);
    }

    #[test]
    fn same_input_sorts_identically_twice() {
        let mut sorter = Sorter::default();
        sorter.select(SortField::Age);
        let items = vec![
            aged("a", "2021-01-01T00:00:00Z"),
            aged("b", "2021-01-01T00:00:00Z"),
            aged("c", "2023-01-01T00:00:00Z"),
        ];
        let mut once = items.clone();
        sorter.sort(&mut once);
        let mut twice = once.clone();
        sorter.sort(&mut twice);
        assert_eq!(once, twice);
    }
}
