//! Derived schema names for the objects backing one overlaid source schema.
//!
//! Every derived name is a fixed prefix plus the source schema name, so the
//! mapping is injective and the source name can always be recovered. No two
//! prefixes are prefixes of each other, which keeps the namespaces disjoint.

/// Common prefix of the foreign mirror namespaces.
pub const LOWER_PREFIX: &str = NamespaceKind::Mirror.prefix();
/// Common prefix of every overlay-owned namespace except the mirrors.
pub const UPPER_PREFIX: &str = "overlay_upper_";

/// One family of derived namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamespaceKind {
    /// Foreign tables imported from the source.
    Mirror,
    /// Keys deleted through the overlay.
    Tombstone,
    /// Rows inserted or updated through the overlay.
    Shadow,
    /// Name prefix for DELETE rules.
    DeleteRule,
    /// Name prefix for INSERT rules.
    InsertRule,
    /// Name prefix for UPDATE rules.
    UpdateRule,
    /// Default-value functions bound to view columns.
    DefaultFunction,
}

impl NamespaceKind {
    pub const ALL: [Self; 7] = [
        Self::Mirror,
        Self::Tombstone,
        Self::Shadow,
        Self::DeleteRule,
        Self::InsertRule,
        Self::UpdateRule,
        Self::DefaultFunction,
    ];

    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Mirror => "overlay_lower_",
            Self::Tombstone => "overlay_upper_deleted_",
            Self::Shadow => "overlay_upper_inserted_",
            Self::DeleteRule => "overlay_upper_delete_rule_",
            Self::InsertRule => "overlay_upper_insert_rule_",
            Self::UpdateRule => "overlay_upper_update_rule_",
            Self::DefaultFunction => "overlay_upper_default_function_",
        }
    }

    /// Derived name of this kind for `source_schema`.
    pub fn derive(self, source_schema: &str) -> String {
        format!("{}{source_schema}", self.prefix())
    }

    /// Recovers the source schema from a name derived with this kind.
    pub fn source_schema(self, derived: &str) -> Option<&str> {
        derived.strip_prefix(self.prefix())
    }

    /// Finds the kind and source schema a derived name came from.
    pub fn classify(derived: &str) -> Option<(Self, &str)> {
        Self::ALL
            .into_iter()
            .find_map(|kind| kind.source_schema(derived).map(|source| (kind, source)))
    }
}

/// All derived names for one source schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceSet {
    pub source_schema: String,
    pub mirror_schema: String,
    pub tombstone_schema: String,
    pub shadow_schema: String,
    pub delete_rule_schema: String,
    pub insert_rule_schema: String,
    pub update_rule_schema: String,
    pub default_fn_schema: String,
}

impl NamespaceSet {
    pub fn for_schema(source_schema: &str) -> Self {
        Self {
            source_schema: source_schema.to_string(),
            mirror_schema: NamespaceKind::Mirror.derive(source_schema),
            tombstone_schema: NamespaceKind::Tombstone.derive(source_schema),
            shadow_schema: NamespaceKind::Shadow.derive(source_schema),
            delete_rule_schema: NamespaceKind::DeleteRule.derive(source_schema),
            insert_rule_schema: NamespaceKind::InsertRule.derive(source_schema),
            update_rule_schema: NamespaceKind::UpdateRule.derive(source_schema),
            default_fn_schema: NamespaceKind::DefaultFunction.derive(source_schema),
        }
    }

    /// The merged views live under the source schema's own name.
    pub fn overlay_schema(&self) -> &str {
        &self.source_schema
    }

    pub fn get(&self, kind: NamespaceKind) -> &str {
        match kind {
            NamespaceKind::Mirror => &self.mirror_schema,
            NamespaceKind::Tombstone => &self.tombstone_schema,
            NamespaceKind::Shadow => &self.shadow_schema,
            NamespaceKind::DeleteRule => &self.delete_rule_schema,
            NamespaceKind::InsertRule => &self.insert_rule_schema,
            NamespaceKind::UpdateRule => &self.update_rule_schema,
            NamespaceKind::DefaultFunction => &self.default_fn_schema,
        }
    }
}

/// Whether a source schema name would alias an overlay-owned namespace.
pub fn is_reserved_schema_name(name: &str) -> bool {
    name.starts_with(LOWER_PREFIX) || name.starts_with(UPPER_PREFIX)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn derived_names_are_prefixed_and_distinct() {
        let set = NamespaceSet::for_schema("public");
        assert_eq!(set.mirror_schema, "overlay_lower_public");
        assert_eq!(set.tombstone_schema, "overlay_upper_deleted_public");
        assert_eq!(set.shadow_schema, "overlay_upper_inserted_public");
        assert_eq!(set.default_fn_schema, "overlay_upper_default_function_public");
        assert_eq!(set.overlay_schema(), "public");

        let names = NamespaceKind::ALL
            .into_iter()
            .map(|kind| set.get(kind))
            .collect::<HashSet<_>>();
        assert_eq!(names.len(), NamespaceKind::ALL.len());
    }

    #[test]
    fn no_prefix_is_a_prefix_of_another() {
        for a in NamespaceKind::ALL {
            for b in NamespaceKind::ALL {
                if a != b {
                    assert!(
                        !a.prefix().starts_with(b.prefix()),
                        "{a:?} prefix overlaps {b:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn source_schema_round_trips_through_every_kind() {
        for source in ["public", "Mixed Case", "схема", "overlay", ""] {
            let set = NamespaceSet::for_schema(source);
            for kind in NamespaceKind::ALL {
                assert_eq!(
                    NamespaceKind::classify(set.get(kind)),
                    Some((kind, source)),
                    "round trip for {kind:?} / {source:?}"
                );
            }
        }
    }

    #[test]
    fn every_derived_namespace_is_reserved() {
        assert_eq!(LOWER_PREFIX, "overlay_lower_");
        for kind in NamespaceKind::ALL {
            let expected = if kind == NamespaceKind::Mirror {
                LOWER_PREFIX
            } else {
                UPPER_PREFIX
            };
            assert!(kind.prefix().starts_with(expected), "{kind:?}");
            assert!(is_reserved_schema_name(&kind.derive("public")), "{kind:?}");
        }
    }

    #[test]
    fn reserved_names_are_detected() {
        assert!(is_reserved_schema_name("overlay_lower_public"));
        assert!(is_reserved_schema_name("overlay_upper_deleted_public"));
        assert!(!is_reserved_schema_name("overlay"));
        assert!(!is_reserved_schema_name("public"));
    }
}
