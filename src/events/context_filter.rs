//! Context serialization with private-attribute redaction.
//!
//! Applied to every event that inlines a context (index, identify, debug).
//! Redacted attribute references are listed in `_meta.redactedAttributes`
//! so the control plane can tell absence from censorship.

use crate::context::{AttributeRef, Context};
use serde_json::{json, Map, Value};

pub(crate) struct ContextFilter {
    all_attributes_private: bool,
    global_private: Vec<AttributeRef>,
}

impl ContextFilter {
    pub(crate) fn new(all_attributes_private: bool, global_private: Vec<AttributeRef>) -> Self {
        Self {
            all_attributes_private,
            global_private,
        }
    }

    /// Serialize a context, redacting private attributes.
    pub(crate) fn filter(&self, context: &Context) -> Value {
        if context.is_multi() {
            let mut obj = Map::new();
            obj.insert("kind".into(), json!("multi"));
            for single in context.contexts() {
                obj.insert(
                    single.kind().as_str().to_owned(),
                    self.filter_single(single, false),
                );
            }
            Value::Object(obj)
        } else {
            self.filter_single(context, true)
        }
    }

    /// The key-only form carried by feature and custom events.
    pub(crate) fn context_keys(context: &Context) -> Value {
        let mut obj = Map::new();
        for single in context.contexts() {
            obj.insert(single.kind().as_str().to_owned(), json!(single.key()));
        }
        Value::Object(obj)
    }

    fn filter_single(&self, context: &Context, include_kind: bool) -> Value {
        let mut redacted: Vec<String> = Vec::new();
        let mut obj = Map::new();
        if include_kind {
            obj.insert("kind".into(), json!(context.kind_str()));
        }
        obj.insert("key".into(), json!(context.key()));
        if context.anonymous() {
            obj.insert("anonymous".into(), json!(true));
        }

        if let Some(name) = context.name() {
            match self.redaction_of(context, "name") {
                Some(reference) => redacted.push(reference),
                None => {
                    obj.insert("name".into(), json!(name));
                }
            }
        }
        for (attr_name, value) in context.attributes() {
            match self.redaction_of(context, attr_name) {
                Some(reference) => redacted.push(reference),
                None => {
                    let mut value = value.clone();
                    self.redact_nested(context, attr_name, &mut value, &mut redacted);
                    obj.insert(attr_name.clone(), value);
                }
            }
        }

        if !redacted.is_empty() {
            obj.insert("_meta".into(), json!({ "redactedAttributes": redacted }));
        }
        Value::Object(obj)
    }

    /// Whole-attribute redaction: the reference that hides `attr_name`
    /// outright, if any.
    fn redaction_of(&self, context: &Context, attr_name: &str) -> Option<String> {
        if self.all_attributes_private {
            return Some(attr_name.to_owned());
        }
        self.private_refs(context)
            .find(|r| r.components().len() == 1 && r.first() == Some(attr_name))
            .map(|r| r.as_str().to_owned())
    }

    /// Multi-component references remove leaves inside object attributes.
    fn redact_nested(
        &self,
        context: &Context,
        attr_name: &str,
        value: &mut Value,
        redacted: &mut Vec<String>,
    ) {
        for reference in self.private_refs(context) {
            let components = reference.components();
            if components.len() < 2 || reference.first() != Some(attr_name) {
                continue;
            }
            if remove_path(value, &components[1..]) {
                redacted.push(reference.as_str().to_owned());
            }
        }
    }

    fn private_refs<'a>(&'a self, context: &'a Context) -> impl Iterator<Item = &'a AttributeRef> {
        self.global_private
            .iter()
            .chain(context.private_attributes().iter())
    }
}

fn remove_path(value: &mut Value, path: &[String]) -> bool {
    match (value, path) {
        (Value::Object(map), [leaf]) => map.remove(leaf).is_some(),
        (Value::Object(map), [head, rest @ ..]) => match map.get_mut(head) {
            Some(inner) => remove_path(inner, rest),
            None => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn redacted_set(filtered: &Value) -> HashSet<String> {
        filtered["_meta"]["redactedAttributes"]
            .as_array()
            .map(|refs| {
                refs.iter()
                    .map(|r| r.as_str().unwrap().to_owned())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn passes_attributes_through_when_nothing_is_private() {
        let context = Context::builder("alice")
            .name("Alice")
            .set("tier", "gold")
            .build()
            .unwrap();
        let filter = ContextFilter::new(false, vec![]);
        let filtered = filter.filter(&context);
        assert_eq!(json!("user"), filtered["kind"]);
        assert_eq!(json!("alice"), filtered["key"]);
        assert_eq!(json!("Alice"), filtered["name"]);
        assert_eq!(json!("gold"), filtered["tier"]);
        assert!(filtered.get("_meta").is_none());
    }

    #[test]
    fn all_attributes_private_keeps_only_protocol_fields() {
        let context = Context::builder("alice")
            .name("Alice")
            .anonymous(true)
            .set("tier", "gold")
            .build()
            .unwrap();
        let filter = ContextFilter::new(true, vec![]);
        let filtered = filter.filter(&context);
        assert_eq!(json!("alice"), filtered["key"]);
        assert_eq!(json!(true), filtered["anonymous"]);
        assert!(filtered.get("name").is_none());
        assert!(filtered.get("tier").is_none());
        let expected: HashSet<String> =
            ["name".into(), "tier".into()].iter().cloned().collect();
        assert_eq!(expected, redacted_set(&filtered));
    }

    #[test]
    fn global_and_per_context_private_refs_combine() {
        let context = Context::builder("alice")
            .name("Alice")
            .set("email", "a@example.com")
            .set("tier", "gold")
            .private("email")
            .build()
            .unwrap();
        let filter = ContextFilter::new(false, vec![AttributeRef::new("name")]);
        let filtered = filter.filter(&context);
        assert!(filtered.get("name").is_none());
        assert!(filtered.get("email").is_none());
        assert_eq!(json!("gold"), filtered["tier"]);
        let expected: HashSet<String> =
            ["name".into(), "email".into()].iter().cloned().collect();
        assert_eq!(expected, redacted_set(&filtered));
    }

    #[test]
    fn nested_reference_removes_only_the_leaf() {
        let context = Context::builder("alice")
            .set("profile", json!({"phone": "555", "city": "Oslo"}))
            .build()
            .unwrap();
        let filter = ContextFilter::new(false, vec![AttributeRef::new("profile.phone")]);
        let filtered = filter.filter(&context);
        assert_eq!(json!({"city": "Oslo"}), filtered["profile"]);
        let expected: HashSet<String> = [String::from("profile.phone")].iter().cloned().collect();
        assert_eq!(expected, redacted_set(&filtered));
    }

    #[test]
    fn missing_nested_path_is_not_reported() {
        let context = Context::builder("alice")
            .set("profile", json!({"city": "Oslo"}))
            .build()
            .unwrap();
        let filter = ContextFilter::new(false, vec![AttributeRef::new("profile.phone")]);
        let filtered = filter.filter(&context);
        assert!(filtered.get("_meta").is_none());
    }

    #[test]
    fn multi_context_filters_each_part() {
        let user = Context::builder("alice").name("Alice").build().unwrap();
        let org = Context::builder("acme")
            .kind("org")
            .set("plan", "enterprise")
            .build()
            .unwrap();
        let multi = Context::multi_builder().add(user).add(org).build().unwrap();
        let filter = ContextFilter::new(false, vec![AttributeRef::new("plan")]);
        let filtered = filter.filter(&multi);
        assert_eq!(json!("multi"), filtered["kind"]);
        assert_eq!(json!("Alice"), filtered["user"]["name"]);
        assert!(filtered["org"].get("plan").is_none());
    }

    #[test]
    fn context_keys_lists_kind_to_key() {
        let user = Context::builder("alice").build().unwrap();
        let org = Context::builder("acme").kind("org").build().unwrap();
        let multi = Context::multi_builder().add(user).add(org).build().unwrap();
        assert_eq!(
            json!({"user": "alice", "org": "acme"}),
            ContextFilter::context_keys(&multi)
        );
    }
}
