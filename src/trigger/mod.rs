//! Trigger: one (timing, event, table) slot and the actions it runs
//!
//! A [`Trigger`] is rendered as two statements: a PL/pgSQL trigger
//! function holding the actions, and the `CREATE TRIGGER` that attaches it
//! to the subject table. Both names are derived from the identity alone,
//! so the same declarations always produce the same catalog objects.
//!
//! ## Naming
//!
//! ```text
//! denorm_<timing>_row_<event>_on_<table>      trigger
//! func_denorm_<timing>_row_<event>_on_<table> trigger function, in the table's schema
//! ```
//!
//! When the prefixed function name would not fit in an identifier, the
//! function takes the trigger's own name. Functions and triggers live in
//! separate namespaces, so any trigger name that fits yields a function
//! name that fits.

pub mod action;

pub use action::{InsertSource, TriggerAction};

use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::{FUNCTION_PREFIX, MAX_IDENTIFIER_LEN, TRIGGER_PREFIX};
use crate::error::{DenormError, DenormResult};
use crate::model::{Column, Model};
use crate::sql::{quote_ident, QualifiedName};

/// Dollar-quote tag around generated function bodies
const BODY_TAG: &str = "$denorm$";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TriggerTiming {
    Before,
    After,
}

impl TriggerTiming {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerTiming::Before => "before",
            TriggerTiming::After => "after",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "before" => Some(TriggerTiming::Before),
            "after" => Some(TriggerTiming::After),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TriggerEvent {
    Insert,
    Update,
    Delete,
}

impl TriggerEvent {
    pub const ALL: [TriggerEvent; 3] = [TriggerEvent::Insert, TriggerEvent::Update, TriggerEvent::Delete];

    pub fn as_str(self) -> &'static str {
        match self {
            TriggerEvent::Insert => "insert",
            TriggerEvent::Update => "update",
            TriggerEvent::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "insert" => Some(TriggerEvent::Insert),
            "update" => Some(TriggerEvent::Update),
            "delete" => Some(TriggerEvent::Delete),
            _ => None,
        }
    }
}

/// What a trigger name encodes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerIdentity {
    pub timing: TriggerTiming,
    pub event: TriggerEvent,
    pub table: String,
}

fn name_pattern() -> DenormResult<&'static Regex> {
    static PATTERN: OnceCell<Regex> = OnceCell::new();
    PATTERN.get_or_try_init(|| {
        Regex::new(&format!(
            r"^{}_(before|after)_row_(insert|update|delete)_on_(.+)$",
            TRIGGER_PREFIX
        ))
        .map_err(|e| crate::internal_error!("Invalid trigger name pattern: {}", e))
    })
}

impl TriggerIdentity {
    pub fn name(&self) -> String {
        format!(
            "{}_{}_row_{}_on_{}",
            TRIGGER_PREFIX,
            self.timing.as_str(),
            self.event.as_str(),
            self.table
        )
    }

    /// Recover the identity from a trigger name. `Ok(None)` for names
    /// outside the family.
    pub fn parse(name: &str) -> DenormResult<Option<Self>> {
        let Some(captures) = name_pattern()?.captures(name) else {
            return Ok(None);
        };

        let timing = captures.get(1).and_then(|m| TriggerTiming::parse(m.as_str()));
        let event = captures.get(2).and_then(|m| TriggerEvent::parse(m.as_str()));
        let table = captures.get(3).map(|m| m.as_str().to_string());

        match (timing, event, table) {
            (Some(timing), Some(event), Some(table)) => Ok(Some(Self { timing, event, table })),
            _ => Ok(None),
        }
    }
}

/// Function backing the trigger `name` on a table in `schema`
pub fn function_name_for(schema: &str, name: &str) -> QualifiedName {
    if FUNCTION_PREFIX.len() + name.len() > MAX_IDENTIFIER_LEN {
        return QualifiedName::new(schema, name);
    }
    QualifiedName::new(schema, &format!("{}{}", FUNCTION_PREFIX, name))
}

/// Statements removing an installed trigger and its function
pub fn drop_statements(name: &str, table: &QualifiedName) -> Vec<String> {
    let schema = table.schema.as_deref().unwrap_or(crate::config::EXTENSION_SCHEMA);
    vec![
        format!("DROP TRIGGER IF EXISTS {} ON {}", quote_ident(name), table.to_sql()),
        format!("DROP FUNCTION IF EXISTS {}()", function_name_for(schema, name).to_sql()),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub subject: QualifiedName,
    pub timing: TriggerTiming,
    pub event: TriggerEvent,
    /// Columns compared by the update condition
    pub columns: Vec<Column>,
    pub actions: Vec<TriggerAction>,
}

impl Trigger {
    pub fn new(subject: QualifiedName, timing: TriggerTiming, event: TriggerEvent) -> Self {
        Self {
            subject,
            timing,
            event,
            columns: Vec::new(),
            actions: Vec::new(),
        }
    }

    /// Row trigger on a model's table, watching all of its columns.
    ///
    /// # Errors
    /// `UnsupportedSubjectType` when the relation cannot carry row triggers
    pub fn on_model(model: &Model, timing: TriggerTiming, event: TriggerEvent) -> DenormResult<Self> {
        if !model.kind.supports_row_triggers() {
            return Err(DenormError::UnsupportedSubjectType {
                table: model.name.to_string(),
                kind: model.kind.describe(),
            });
        }

        let mut trigger = Self::new(model.name.clone(), timing, event);
        trigger.columns = model.columns.clone();
        Ok(trigger)
    }

    /// Stop watching `skip` in the update condition
    pub fn skipping(mut self, skip: &[String]) -> Self {
        self.columns.retain(|column| !skip.contains(&column.name));
        self
    }

    pub fn with_action(mut self, action: TriggerAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn identity(&self) -> TriggerIdentity {
        TriggerIdentity {
            timing: self.timing,
            event: self.event,
            table: self.subject.name.clone(),
        }
    }

    pub fn name(&self) -> String {
        self.identity().name()
    }

    pub fn schema(&self) -> &str {
        self.subject
            .schema
            .as_deref()
            .unwrap_or(crate::config::EXTENSION_SCHEMA)
    }

    pub fn function_name(&self) -> QualifiedName {
        function_name_for(self.schema(), &self.name())
    }

    /// The trigger name must fit in a PostgreSQL identifier; the catalog
    /// would silently truncate it otherwise. The function name follows.
    pub fn validate(&self) -> DenormResult<()> {
        let name = self.name();
        if name.len() > MAX_IDENTIFIER_LEN {
            return Err(DenormError::TriggerNameTooLong {
                name,
                max_len: MAX_IDENTIFIER_LEN,
            });
        }
        Ok(())
    }

    /// Append the actions of a trigger with the same identity, keeping
    /// this trigger's actions first.
    pub fn merge(&mut self, other: Trigger) {
        for column in other.columns {
            if !self.columns.contains(&column) {
                self.columns.push(column);
            }
        }
        self.actions.extend(other.actions);
    }

    /// `OLD.c IS DISTINCT FROM NEW.c OR ...` for update triggers with
    /// known columns
    pub fn condition(&self) -> Option<String> {
        if self.event != TriggerEvent::Update || self.columns.is_empty() {
            return None;
        }

        let checks = self
            .columns
            .iter()
            .map(|column| {
                let name = quote_ident(&column.name);
                if column.compares_as_text() {
                    format!("(OLD.{name}::text IS DISTINCT FROM NEW.{name}::text)")
                } else {
                    format!("(OLD.{name} IS DISTINCT FROM NEW.{name})")
                }
            })
            .collect::<Vec<_>>();

        Some(checks.join(" OR "))
    }

    /// Rendered actions, identical statements emitted once
    pub fn statements(&self) -> Vec<String> {
        let mut statements: Vec<String> = Vec::new();
        for sql in self.actions.iter().map(TriggerAction::to_sql) {
            if !statements.contains(&sql) {
                statements.push(sql);
            }
        }
        statements
    }

    fn return_value(&self) -> &'static str {
        match (self.timing, self.event) {
            (TriggerTiming::After, _) => "NULL",
            (TriggerTiming::Before, TriggerEvent::Delete) => "OLD",
            (TriggerTiming::Before, _) => "NEW",
        }
    }

    /// PL/pgSQL source of the trigger function, exactly as stored in
    /// `pg_proc.prosrc`
    pub fn body(&self) -> String {
        let mut body = String::from("\nBEGIN\n");

        let statements = self.statements();
        match self.condition() {
            Some(condition) if !statements.is_empty() => {
                body.push_str(&format!("    IF {} THEN\n", condition));
                for statement in &statements {
                    body.push_str(&format!("        {}\n", statement));
                }
                body.push_str("    END IF;\n");
            }
            _ => {
                for statement in &statements {
                    body.push_str(&format!("    {}\n", statement));
                }
            }
        }

        body.push_str(&format!("    RETURN {};\nEND;\n", self.return_value()));
        body
    }

    pub fn function_sql(&self) -> String {
        format!(
            "CREATE OR REPLACE FUNCTION {}() RETURNS TRIGGER AS {}{}{} LANGUAGE plpgsql",
            self.function_name().to_sql(),
            BODY_TAG,
            self.body(),
            BODY_TAG
        )
    }

    pub fn create_sql(&self) -> String {
        format!(
            "CREATE TRIGGER {} {} {} ON {} FOR EACH ROW EXECUTE PROCEDURE {}()",
            quote_ident(&self.name()),
            self.timing.as_str().to_uppercase(),
            self.event.as_str().to_uppercase(),
            self.subject.to_sql(),
            self.function_name().to_sql()
        )
    }

    /// Function first, then the trigger using it
    pub fn sql(&self) -> Vec<String> {
        vec![self.function_sql(), self.create_sql()]
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.name(), self.subject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::testing::assert_error_sqlstate;
    use crate::model::RelationKind;
    use crate::sql::ValueExpr;

    fn queue() -> QualifiedName {
        QualifiedName::new("public", "denorm_dirty_instance")
    }

    fn enqueue(content_type: &str, column: &str) -> TriggerAction {
        TriggerAction::insert(
            queue(),
            &["content_type", "object_id", "old_object_id"],
            vec![ValueExpr::text(content_type), ValueExpr::new_row(column), ValueExpr::new_row(column)],
        )
        .unwrap()
    }

    fn users() -> Model {
        Model::new("public", "users")
            .primary_key("id")
            .column("email", "text")
            .text_column("settings", "json")
    }

    #[test]
    fn test_name_is_derived_from_identity() {
        let trigger = Trigger::new(QualifiedName::new("public", "users"), TriggerTiming::After, TriggerEvent::Update);
        assert_eq!(trigger.name(), "denorm_after_row_update_on_users");
        assert_eq!(trigger.function_name().to_string(), "public.func_denorm_after_row_update_on_users");

        let other_schema = Trigger::new(QualifiedName::new("crm", "users"), TriggerTiming::After, TriggerEvent::Update);
        assert_eq!(other_schema.name(), trigger.name());
        assert_eq!(other_schema.function_name().to_string(), "crm.func_denorm_after_row_update_on_users");
    }

    #[test]
    fn test_name_round_trips_through_create_sql() {
        for event in TriggerEvent::ALL {
            let trigger = Trigger::new(QualifiedName::new("public", "order_line"), TriggerTiming::After, event);
            let sql = trigger.create_sql();
            let name = sql
                .trim_start_matches("CREATE TRIGGER ")
                .split_whitespace()
                .next()
                .unwrap();

            let identity = TriggerIdentity::parse(name).unwrap().unwrap();
            assert_eq!(identity, trigger.identity());
            assert_eq!(identity.table, "order_line");
        }
    }

    #[test]
    fn test_foreign_names_do_not_parse() {
        assert_eq!(TriggerIdentity::parse("audit_users").unwrap(), None);
        assert_eq!(TriggerIdentity::parse("denorm_after_row_truncate_on_users").unwrap(), None);
    }

    #[test]
    fn test_on_model_rejects_views() {
        let view = Model::new("public", "active_users").kind(RelationKind::View);
        assert_error_sqlstate(
            Trigger::on_model(&view, TriggerTiming::After, TriggerEvent::Insert),
            "42809",
        );
    }

    #[test]
    fn test_update_condition_covers_columns() {
        let trigger = Trigger::on_model(&users(), TriggerTiming::After, TriggerEvent::Update).unwrap();
        assert_eq!(
            trigger.condition().unwrap(),
            "(OLD.id IS DISTINCT FROM NEW.id) OR (OLD.email IS DISTINCT FROM NEW.email) \
             OR (OLD.settings::text IS DISTINCT FROM NEW.settings::text)"
        );

        let insert = Trigger::on_model(&users(), TriggerTiming::After, TriggerEvent::Insert).unwrap();
        assert_eq!(insert.condition(), None);
    }

    #[test]
    fn test_skipped_columns_leave_the_condition() {
        let trigger = Trigger::on_model(&users(), TriggerTiming::After, TriggerEvent::Update)
            .unwrap()
            .skipping(&["settings".to_string(), "id".to_string()]);
        assert_eq!(trigger.condition().unwrap(), "(OLD.email IS DISTINCT FROM NEW.email)");
    }

    #[test]
    fn test_merge_watches_columns_any_side_needs() {
        let skip_settings = Trigger::on_model(&users(), TriggerTiming::After, TriggerEvent::Update)
            .unwrap()
            .skipping(&["settings".to_string()]);
        let mut skip_email = Trigger::on_model(&users(), TriggerTiming::After, TriggerEvent::Update)
            .unwrap()
            .skipping(&["email".to_string()]);

        skip_email.merge(skip_settings);
        let names: Vec<_> = skip_email.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "settings", "email"]);
    }

    #[test]
    fn test_body_of_insert_trigger() {
        let trigger = Trigger::on_model(&users(), TriggerTiming::After, TriggerEvent::Insert)
            .unwrap()
            .with_action(enqueue("public.users", "id"));

        assert_eq!(
            trigger.body(),
            "\nBEGIN\n    \
             INSERT INTO public.denorm_dirty_instance (content_type, object_id, old_object_id) \
             VALUES ('public.users', NEW.id, NEW.id);\n    \
             RETURN NULL;\nEND;\n"
        );
    }

    #[test]
    fn test_update_body_is_wrapped_in_condition() {
        let trigger = Trigger::new(QualifiedName::new("public", "users"), TriggerTiming::After, TriggerEvent::Update)
            .with_action(enqueue("public.users", "id"));
        let mut watched = trigger.clone();
        watched.columns = vec![Column::new("email", "text")];

        assert!(!trigger.body().contains("IF "));
        assert!(watched
            .body()
            .starts_with("\nBEGIN\n    IF (OLD.email IS DISTINCT FROM NEW.email) THEN\n        INSERT INTO"));
        assert!(watched.body().ends_with("    END IF;\n    RETURN NULL;\nEND;\n"));
    }

    #[test]
    fn test_merge_preserves_order_and_dedupes() {
        let subject = QualifiedName::new("public", "users");
        let mut first = Trigger::new(subject.clone(), TriggerTiming::After, TriggerEvent::Update)
            .with_action(enqueue("public.profile", "id"));
        let second = Trigger::new(subject, TriggerTiming::After, TriggerEvent::Update)
            .with_action(enqueue("public.team", "team_id"))
            .with_action(enqueue("public.profile", "id"));

        first.merge(second);
        assert_eq!(first.actions.len(), 3);

        let statements = first.statements();
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("'public.profile'"));
        assert!(statements[1].contains("'public.team'"));
    }

    #[test]
    fn test_before_triggers_return_row() {
        let delete = Trigger::new(QualifiedName::unqualified("users"), TriggerTiming::Before, TriggerEvent::Delete);
        assert!(delete.body().contains("RETURN OLD;"));
        let insert = Trigger::new(QualifiedName::unqualified("users"), TriggerTiming::Before, TriggerEvent::Insert);
        assert!(insert.body().contains("RETURN NEW;"));
        assert!(insert.create_sql().contains(" BEFORE INSERT ON users "));
    }

    #[test]
    fn test_function_and_trigger_sql() {
        let trigger = Trigger::new(QualifiedName::new("public", "users"), TriggerTiming::After, TriggerEvent::Delete);
        let sql = trigger.sql();

        assert!(sql[0].starts_with(
            "CREATE OR REPLACE FUNCTION public.func_denorm_after_row_delete_on_users() RETURNS TRIGGER AS $denorm$"
        ));
        assert!(sql[0].ends_with("$denorm$ LANGUAGE plpgsql"));
        assert_eq!(
            sql[1],
            "CREATE TRIGGER denorm_after_row_delete_on_users AFTER DELETE ON public.users \
             FOR EACH ROW EXECUTE PROCEDURE public.func_denorm_after_row_delete_on_users()"
        );
    }

    #[test]
    fn test_name_length_is_validated() {
        let long = "t".repeat(40);
        let trigger = Trigger::new(QualifiedName::new("public", &long), TriggerTiming::After, TriggerEvent::Update);
        assert_error_sqlstate(trigger.validate(), "42622");

        let short = Trigger::new(QualifiedName::new("public", "users"), TriggerTiming::After, TriggerEvent::Update);
        assert!(short.validate().is_ok());
    }

    #[test]
    fn test_longest_table_name_keeps_a_valid_function_name() {
        let table = "customer_subscription_line_items_ext";
        assert_eq!(table.len(), 36);

        let trigger = Trigger::new(QualifiedName::new("public", table), TriggerTiming::After, TriggerEvent::Update);
        assert_eq!(trigger.name().len(), MAX_IDENTIFIER_LEN);
        assert!(trigger.validate().is_ok());
        assert_eq!(trigger.function_name().name, trigger.name());

        let mut set = crate::trigger_set::TriggerSet::new();
        assert!(set.append(trigger.clone()).is_ok());
        assert_eq!(
            drop_statements(&trigger.name(), &trigger.subject)[1],
            format!("DROP FUNCTION IF EXISTS public.{}()", trigger.name())
        );

        let one_more = Trigger::new(QualifiedName::new("public", &format!("{}s", table)), TriggerTiming::After, TriggerEvent::Update);
        assert_error_sqlstate(one_more.validate(), "42622");
    }

    #[test]
    fn test_function_prefix_kept_while_it_fits() {
        let table = "t".repeat(31);
        let trigger = Trigger::new(QualifiedName::new("public", &table), TriggerTiming::After, TriggerEvent::Insert);
        assert_eq!(trigger.function_name().name, format!("func_{}", trigger.name()));
        assert_eq!(trigger.function_name().name.len(), MAX_IDENTIFIER_LEN);

        let longer = Trigger::new(QualifiedName::new("public", &format!("{}t", table)), TriggerTiming::After, TriggerEvent::Insert);
        assert_eq!(longer.function_name().name, longer.name());
    }

    #[test]
    fn test_drop_statements() {
        let statements = drop_statements("denorm_after_row_insert_on_post", &QualifiedName::new("blog", "post"));
        assert_eq!(
            statements,
            vec![
                "DROP TRIGGER IF EXISTS denorm_after_row_insert_on_post ON blog.post".to_string(),
                "DROP FUNCTION IF EXISTS blog.func_denorm_after_row_insert_on_post()".to_string(),
            ]
        );
    }
}
