//! Trigger Set: the triggers the current declarations require
//!
//! Keyed by trigger name. Two dependencies landing on the same
//! (timing, event, table) slot share one physical trigger; [`TriggerSet::append`]
//! merges their actions in declaration order.
//!
//! Reconciliation against the catalog is split into a pure planning step
//! ([`TriggerSet::plan`]) and the SPI side in [`reconcile`].

pub mod catalog;
pub mod reconcile;

pub use catalog::{installed_triggers, InstalledTrigger};
pub use reconcile::ReconcileReport;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::dependency::ResolvedDependency;
use crate::error::{DenormError, DenormResult};
use crate::sql::QualifiedName;
use crate::trigger::Trigger;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerSet {
    triggers: BTreeMap<String, Trigger>,
}

impl TriggerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Triggers of every resolved dependency, merged
    pub fn from_dependencies(dependencies: &[ResolvedDependency]) -> DenormResult<Self> {
        let mut set = Self::new();
        for dependency in dependencies {
            for trigger in dependency.get_triggers()? {
                set.append(trigger)?;
            }
        }
        Ok(set)
    }

    /// Add a trigger, merging into an existing one with the same name.
    ///
    /// # Errors
    /// `TriggerNameTooLong` when the derived names exceed the identifier
    /// limit, `InvalidInput` when tables of the same name in two schemas
    /// would share a trigger name
    pub fn append(&mut self, trigger: Trigger) -> DenormResult<()> {
        trigger.validate()?;

        let name = trigger.name();
        match self.triggers.get_mut(&name) {
            Some(existing) if existing.subject != trigger.subject => {
                return Err(DenormError::InvalidInput {
                    parameter: "trigger".to_string(),
                    value: name,
                    reason: format!("derived for both {} and {}", existing.subject, trigger.subject),
                });
            }
            Some(existing) => existing.merge(trigger),
            None => {
                self.triggers.insert(name, trigger);
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Trigger> {
        self.triggers.get(name)
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.triggers.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Trigger> {
        self.triggers.values()
    }

    /// Whether an installed trigger is the one required under its name
    fn requires(&self, installed: &InstalledTrigger) -> Option<&Trigger> {
        self.triggers
            .get(&installed.name)
            .filter(|trigger| trigger.subject == installed.table)
    }

    /// Diff against what the catalog holds.
    ///
    /// - `drops`: installed, but not required on that table
    /// - `installs`: required, not installed
    /// - `refreshes`: installed on the right table with a stale function body
    /// - `unchanged`: installed and identical
    pub fn plan(&self, installed: &[InstalledTrigger]) -> ReconcilePlan {
        let mut plan = ReconcilePlan::default();

        for trigger in installed {
            match self.requires(trigger) {
                None => plan.drops.push(trigger.clone()),
                Some(required) if required.body() != trigger.body => plan.refreshes.push(trigger.name.clone()),
                Some(_) => plan.unchanged.push(trigger.name.clone()),
            }
        }

        for (name, trigger) in &self.triggers {
            let present = installed
                .iter()
                .any(|i| &i.name == name && i.table == trigger.subject);
            if !present {
                plan.installs.push(name.clone());
            }
        }

        plan
    }
}

/// What one reconciliation run has to do
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilePlan {
    pub drops: Vec<InstalledTrigger>,
    pub installs: Vec<String>,
    pub refreshes: Vec<String>,
    pub unchanged: Vec<String>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.drops.is_empty() && self.installs.is_empty() && self.refreshes.is_empty()
    }
}

impl InstalledTrigger {
    pub fn new(name: &str, table: QualifiedName, body: &str) -> Self {
        Self {
            name: name.to_string(),
            table,
            body: body.to_string(),
        }
    }

    /// The catalog row a required trigger leaves behind once installed
    pub fn from_trigger(trigger: &Trigger) -> Self {
        Self::new(&trigger.name(), trigger.subject.clone(), &trigger.body())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::{Dependency, DependencyRegistry};
    use crate::error::testing::assert_error_sqlstate;
    use crate::model::{Model, ModelRegistry};
    use crate::sql::ValueExpr;
    use crate::trigger::{TriggerAction, TriggerEvent, TriggerTiming};

    fn users() -> QualifiedName {
        QualifiedName::new("public", "users")
    }

    fn enqueue(content_type: &str) -> TriggerAction {
        TriggerAction::insert(
            QualifiedName::new("public", "denorm_dirty_instance"),
            &["content_type", "object_id", "old_object_id"],
            vec![ValueExpr::text(content_type), ValueExpr::new_row("id"), ValueExpr::old_row("id")],
        )
        .unwrap()
    }

    fn trigger(table: &str, event: TriggerEvent) -> Trigger {
        Trigger::new(QualifiedName::new("public", table), TriggerTiming::After, event)
            .with_action(enqueue("public.profile"))
    }

    #[test]
    fn test_colliding_names_merge_in_order() {
        let mut set = TriggerSet::new();
        set.append(Trigger::new(users(), TriggerTiming::After, TriggerEvent::Update).with_action(enqueue("public.profile")))
            .unwrap();
        set.append(Trigger::new(users(), TriggerTiming::After, TriggerEvent::Update).with_action(enqueue("public.team")))
            .unwrap();

        assert_eq!(set.len(), 1);
        let merged = set.get("denorm_after_row_update_on_users").unwrap();
        let body = merged.body();
        let profile = body.find("'public.profile'").unwrap();
        let team = body.find("'public.team'").unwrap();
        assert!(profile < team);
    }

    #[test]
    fn test_append_rejects_same_name_across_schemas() {
        let mut set = TriggerSet::new();
        set.append(Trigger::new(users(), TriggerTiming::After, TriggerEvent::Insert)).unwrap();
        let other = Trigger::new(QualifiedName::new("crm", "users"), TriggerTiming::After, TriggerEvent::Insert);
        assert_error_sqlstate(set.append(other), "22023");
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_append_rejects_long_names() {
        let mut set = TriggerSet::new();
        let long = Trigger::new(QualifiedName::new("public", &"x".repeat(50)), TriggerTiming::After, TriggerEvent::Insert);
        assert_error_sqlstate(set.append(long), "42622");
        assert!(set.is_empty());
    }

    #[test]
    fn test_plan_drops_installs_and_keeps() {
        let t1 = trigger("t1", TriggerEvent::Insert);
        let t2 = trigger("t2", TriggerEvent::Insert);
        let t3 = trigger("t3", TriggerEvent::Insert);

        let mut required = TriggerSet::new();
        required.append(t2.clone()).unwrap();
        required.append(t3.clone()).unwrap();

        let installed = vec![InstalledTrigger::from_trigger(&t1), InstalledTrigger::from_trigger(&t2)];
        let plan = required.plan(&installed);

        assert_eq!(plan.drops.len(), 1);
        assert_eq!(plan.drops[0].name, t1.name());
        assert_eq!(plan.installs, vec![t3.name()]);
        assert_eq!(plan.unchanged, vec![t2.name()]);
        assert!(plan.refreshes.is_empty());
    }

    #[test]
    fn test_plan_is_empty_once_converged() {
        let mut required = TriggerSet::new();
        for event in TriggerEvent::ALL {
            required.append(trigger("users", event)).unwrap();
        }

        let first = required.plan(&[]);
        assert_eq!(first.installs.len(), 3);

        let installed: Vec<_> = required.iter().map(InstalledTrigger::from_trigger).collect();
        let second = required.plan(&installed);
        assert!(second.is_empty());
        assert_eq!(second.unchanged.len(), 3);
    }

    #[test]
    fn test_changed_body_is_refreshed_not_reinstalled() {
        let mut required = TriggerSet::new();
        required
            .append(trigger("users", TriggerEvent::Update).with_action(enqueue("public.team")))
            .unwrap();

        let stale = InstalledTrigger::from_trigger(&trigger("users", TriggerEvent::Update));
        let plan = required.plan(&[stale]);

        assert_eq!(plan.refreshes, vec!["denorm_after_row_update_on_users".to_string()]);
        assert!(plan.installs.is_empty());
        assert!(plan.drops.is_empty());
    }

    #[test]
    fn test_same_name_on_other_table_is_replaced() {
        let mut required = TriggerSet::new();
        required.append(trigger("users", TriggerEvent::Delete)).unwrap();

        let moved = InstalledTrigger::new(
            "denorm_after_row_delete_on_users",
            QualifiedName::new("archive", "users"),
            "",
        );
        let plan = required.plan(&[moved]);

        assert_eq!(plan.drops.len(), 1);
        assert_eq!(plan.installs, vec!["denorm_after_row_delete_on_users".to_string()]);
    }

    #[test]
    fn test_two_owners_share_source_triggers() {
        let users = QualifiedName::new("public", "users");
        let models = ModelRegistry::new()
            .with(Model::new("public", "users").primary_key("id").column("email", "text"))
            .with(Model::new("public", "profile").primary_key("id").foreign_key("user_id", &users, "id"))
            .with(Model::new("public", "team").primary_key("id").foreign_key("owner_id", &users, "id"));

        let mut registry = DependencyRegistry::new();
        registry.register(Dependency::related("profile", "users", None));
        registry.register(Dependency::related("team", "users", None));

        let resolved = registry.finalize(&models).unwrap();
        let set = TriggerSet::from_dependencies(&resolved).unwrap();

        assert_eq!(
            set.names().collect::<Vec<_>>(),
            vec![
                "denorm_after_row_delete_on_users",
                "denorm_after_row_insert_on_users",
                "denorm_after_row_update_on_users",
            ]
        );

        let update = set.get("denorm_after_row_update_on_users").unwrap();
        assert_eq!(update.statements().len(), 2);
        assert!(update.statements()[0].contains("FROM public.profile WHERE user_id = NEW.id"));
        assert!(update.statements()[1].contains("FROM public.team WHERE owner_id = NEW.id"));
    }
}
