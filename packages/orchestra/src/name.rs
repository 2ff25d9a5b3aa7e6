//! Command name resolution.
//!
//! Registered handlers and enqueued commands meet on a short snake_case
//! name. When no explicit name is given, one is derived from the command
//! type: the last path segment, minus one trailing `Command`, converted to
//! snake_case. `SendEmailCommand` and `SendEmail` both resolve to
//! `send_email`. Derived names are cached per type for the life of the
//! process.

use std::any::TypeId;
use std::sync::OnceLock;

use dashmap::DashMap;

static NAME_CACHE: OnceLock<DashMap<TypeId, &'static str>> = OnceLock::new();

/// Resolve the canonical command name for a type.
///
/// Deterministic: the same type always yields the same name. The first
/// resolution leaks the derived string so later lookups are a map hit.
pub fn command_name_of<T: 'static>() -> &'static str {
    let cache = NAME_CACHE.get_or_init(DashMap::new);
    *cache
        .entry(TypeId::of::<T>())
        .or_insert_with(|| Box::leak(derive_command_name(std::any::type_name::<T>()).into_boxed_str()))
}

/// Derive a snake_case command name from a Rust type name.
pub fn derive_command_name(type_name: &str) -> String {
    // `type_name` may carry a module path and generic arguments
    let base = type_name.split('<').next().unwrap_or(type_name);
    let base = base.rsplit("::").next().unwrap_or(base);
    let base = base.strip_suffix("Command").filter(|s| !s.is_empty()).unwrap_or(base);

    let mut out = String::with_capacity(base.len() + 4);
    for (i, ch) in base.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}
