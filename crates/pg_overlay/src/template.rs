//! `#{slot}` SQL templates with identifier-safe substitution.
//!
//! Every statement the overlay submits is produced here. Templates are declared
//! with [`sql_template!`], which turns the slot list into a struct so that a
//! statement cannot be built with a missing or mistyped binding. Substitution
//! itself stays a runtime pass so the quoting rules live in one place.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::error::SubstitutionError;

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"#\{([^}]+)\}").unwrap());

/// Key reported when a fragment builder fails outside of a template binding.
const FRAGMENT_KEY: &str = "fragment";

/// One bound slot value.
#[derive(Clone, PartialEq, Eq)]
pub enum SqlValue {
    /// A single identifier, rendered double-quoted.
    Ident(String),
    /// Dotted identifier path, each segment quoted individually.
    Qualified(Vec<String>),
    /// Pre-escaped SQL inserted verbatim.
    Raw(String),
    /// String constant rendered as a quoted literal.
    Literal(String),
    /// Like `Literal`, but never printed in diagnostics.
    Secret(String),
}

impl fmt::Debug for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(name) => f.debug_tuple("Ident").field(name).finish(),
            Self::Qualified(parts) => f.debug_tuple("Qualified").field(parts).finish(),
            Self::Raw(sql) => f.debug_tuple("Raw").field(sql).finish(),
            Self::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            Self::Secret(_) => f.write_str("Secret(<redacted>)"),
        }
    }
}

impl SqlValue {
    fn render(&self, key: &str) -> Result<String, SubstitutionError> {
        match self {
            Self::Ident(name) => quote_ident_for(key, name),
            Self::Qualified(parts) => {
                if parts.is_empty() {
                    return Err(SubstitutionError::EmptyQualifiedName {
                        key: key.to_string(),
                    });
                }
                let quoted = parts
                    .iter()
                    .map(|part| quote_ident_for(key, part))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(quoted.join("."))
            }
            Self::Raw(sql) => Ok(sql.clone()),
            Self::Literal(value) | Self::Secret(value) => quote_literal_for(key, value),
        }
    }
}

/// Plain identifier slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ident(pub String);

impl Ident {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

/// Schema-qualified (or longer) identifier slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedName(pub Vec<String>);

impl QualifiedName {
    /// `schema.name`, the shape nearly every overlay object uses.
    pub fn pair(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self(vec![schema.into(), name.into()])
    }

    /// Renders the quoted dotted form for use inside raw fragments.
    pub fn quoted(&self) -> Result<String, SubstitutionError> {
        SqlValue::Qualified(self.0.clone()).render(FRAGMENT_KEY)
    }
}

/// Verbatim SQL slot. Only assemble these from already-quoted parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSql(String);

impl RawSql {
    pub fn new(sql: impl Into<String>) -> Self {
        Self(sql.into())
    }
}

/// String literal slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Literal(pub String);

/// String literal slot whose value is redacted from logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretLiteral(String);

impl SecretLiteral {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Debug for SecretLiteral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretLiteral(<redacted>)")
    }
}

impl From<Ident> for SqlValue {
    fn from(value: Ident) -> Self {
        Self::Ident(value.0)
    }
}

impl From<QualifiedName> for SqlValue {
    fn from(value: QualifiedName) -> Self {
        Self::Qualified(value.0)
    }
}

impl From<RawSql> for SqlValue {
    fn from(value: RawSql) -> Self {
        Self::Raw(value.0)
    }
}

impl From<Literal> for SqlValue {
    fn from(value: Literal) -> Self {
        Self::Literal(value.0)
    }
}

impl From<SecretLiteral> for SqlValue {
    fn from(value: SecretLiteral) -> Self {
        Self::Secret(value.0)
    }
}

/// Slot name to value mapping for one substitution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings {
    values: BTreeMap<String, SqlValue>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<SqlValue>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&SqlValue> {
        self.values.get(key)
    }
}

/// Replaces every `#{key}` in `template` with its rendered binding.
///
/// On failure the template and the (redacted) bindings are logged before the
/// error is returned, so the caller only needs to propagate it.
pub fn substitute(template: &str, bindings: &Bindings) -> Result<String, SubstitutionError> {
    render_template(template, bindings).inspect_err(|err| {
        warn!(
            template,
            bindings = ?bindings,
            error = %err,
            "failed to substitute SQL template"
        );
    })
}

fn render_template(template: &str, bindings: &Bindings) -> Result<String, SubstitutionError> {
    let mut rendered = String::with_capacity(template.len());
    let mut cursor = 0;
    for captures in PLACEHOLDER_RE.captures_iter(template) {
        let (Some(whole), Some(key)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        rendered.push_str(&template[cursor..whole.start()]);
        let value = bindings
            .get(key.as_str())
            .ok_or_else(|| SubstitutionError::MissingKey {
                key: key.as_str().to_string(),
                template: template.to_string(),
            })?;
        rendered.push_str(&value.render(key.as_str())?);
        cursor = whole.end();
    }
    rendered.push_str(&template[cursor..]);
    Ok(rendered)
}

/// Placeholder names referenced by `template`.
pub fn placeholders(template: &str) -> BTreeSet<&str> {
    PLACEHOLDER_RE
        .captures_iter(template)
        .filter_map(|captures| captures.get(1).map(|key| key.as_str()))
        .collect()
}

/// Quotes one identifier: `my "table"` becomes `"my ""table"""`.
pub fn quote_ident(name: &str) -> Result<String, SubstitutionError> {
    quote_ident_for(FRAGMENT_KEY, name)
}

/// Quotes a string constant, switching to `E''` syntax when backslashes occur.
pub fn quote_literal(value: &str) -> Result<String, SubstitutionError> {
    quote_literal_for(FRAGMENT_KEY, value)
}

fn quote_ident_for(key: &str, name: &str) -> Result<String, SubstitutionError> {
    if name.is_empty() {
        return Err(SubstitutionError::EmptyIdentifier {
            key: key.to_string(),
        });
    }
    if name.contains('\0') {
        return Err(SubstitutionError::NulCharacter {
            key: key.to_string(),
        });
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

fn quote_literal_for(key: &str, value: &str) -> Result<String, SubstitutionError> {
    if value.contains('\0') {
        return Err(SubstitutionError::NulCharacter {
            key: key.to_string(),
        });
    }
    let escaped = value.replace('\'', "''");
    if escaped.contains('\\') {
        Ok(format!("E'{}'", escaped.replace('\\', "\\\\")))
    } else {
        Ok(format!("'{escaped}'"))
    }
}

/// Compile-time description of a template: its text and declared slots.
pub trait SqlTemplate {
    /// Template text with `#{slot}` placeholders.
    const TEMPLATE: &'static str;
    /// Declared slots, in field order.
    const SLOTS: &'static [&'static str];

    /// Renders the template with this value's bindings.
    fn render(&self) -> Result<String, SubstitutionError>;
}

/// Declares a template struct whose fields are its slots.
///
/// ```ignore
/// sql_template! {
///     pub struct CreateSchema { name: Ident } = "CREATE SCHEMA IF NOT EXISTS #{name};";
/// }
/// ```
macro_rules! sql_template {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $($field:ident : $kind:ty),* $(,)?
        } = $template:expr;
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        $vis struct $name {
            $(pub $field: $kind,)*
        }

        impl $crate::template::SqlTemplate for $name {
            const TEMPLATE: &'static str = $template;
            const SLOTS: &'static [&'static str] = &[$(stringify!($field)),*];

            #[allow(unused_mut)]
            fn render(&self) -> Result<String, $crate::error::SubstitutionError> {
                let mut bindings = $crate::template::Bindings::new();
                $(bindings.insert(stringify!($field), self.$field.clone());)*
                $crate::template::substitute(Self::TEMPLATE, &bindings)
            }
        }
    };
}

pub(crate) use sql_template;

/// A rendered statement ready for submission.
///
/// `description` is what logs and error contexts print. The SQL text itself is
/// only logged at `trace` level, and never when `sensitive` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub description: String,
    pub sql: String,
    pub sensitive: bool,
}

impl Statement {
    pub fn new(description: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            sql: sql.into(),
            sensitive: false,
        }
    }

    /// Marks the statement as carrying credentials.
    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    /// Renders `template` into a statement labelled `description`.
    pub fn render<T: SqlTemplate>(
        description: impl Into<String>,
        template: &T,
    ) -> Result<Self, SubstitutionError> {
        Ok(Self::new(description, template.render()?))
    }
}

/// Asserts that a template's placeholders are exactly its declared slots.
#[cfg(test)]
pub(crate) fn assert_slots_match<T: SqlTemplate>() {
    let found = placeholders(T::TEMPLATE);
    let declared = T::SLOTS.iter().copied().collect::<BTreeSet<_>>();
    assert_eq!(
        found,
        declared,
        "template slots drifted from struct fields for {}",
        std::any::type_name::<T>()
    );
}
