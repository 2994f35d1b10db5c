use super::{Direction, ResolvedDependency};
use crate::dirty;
use crate::error::DenormResult;
use crate::sql::{NestedSelect, RowVersion, ValueExpr};
use crate::trigger::{Trigger, TriggerAction, TriggerEvent, TriggerTiming};

impl ResolvedDependency {
    /// The after-insert, after-update and after-delete triggers on the
    /// source table, each enqueueing the affected owners.
    ///
    /// # Errors
    /// `UnsupportedSubjectType` when the source cannot carry row triggers,
    /// `MissingPrimaryKey` for forward dependencies on a keyless owner
    pub fn get_triggers(&self) -> DenormResult<Vec<Trigger>> {
        TriggerEvent::ALL
            .into_iter()
            .map(|event| -> DenormResult<Trigger> {
                let action = match self.direction {
                    Direction::Forward => self.forward_action(event)?,
                    Direction::Backward => self.backward_action(event)?,
                };
                Ok(Trigger::on_model(&self.source, TriggerTiming::After, event)?
                    .skipping(&self.declaration.skip)
                    .with_action(action))
            })
            .collect()
    }

    /// Owners whose foreign key points at the changed source row:
    /// `SELECT DISTINCT ct, pk, pk FROM owner WHERE fk = NEW.ref`.
    /// Deletes look the owners up through `OLD.ref`; both id slots carry
    /// the owner id.
    fn forward_action(&self, event: TriggerEvent) -> DenormResult<TriggerAction> {
        let primary_key = self.owner.require_primary_key()?;
        let row = match event {
            TriggerEvent::Delete => RowVersion::Old,
            TriggerEvent::Insert | TriggerEvent::Update => RowVersion::New,
        };

        let select = NestedSelect::new(
            self.owner.name.clone(),
            vec![
                ValueExpr::text(&self.owner.content_type()),
                ValueExpr::column(primary_key),
                ValueExpr::column(primary_key),
            ],
        )
        .filter(
            &self.foreign_key.column,
            ValueExpr::Row(row, self.foreign_key.target_column.clone()),
        )
        .distinct();

        dirty::enqueue_select(select)
    }

    /// The changed source row names its owner through its own foreign key.
    /// Updates record the previous owner in `old_object_id`; a NULL key
    /// enqueues nothing.
    fn backward_action(&self, event: TriggerEvent) -> DenormResult<TriggerAction> {
        let fk = self.foreign_key.column.as_str();
        let (object_id, old_object_id) = match event {
            TriggerEvent::Insert => (ValueExpr::new_row(fk), ValueExpr::new_row(fk)),
            TriggerEvent::Update => (
                ValueExpr::coalesce(ValueExpr::new_row(fk), ValueExpr::old_row(fk)),
                ValueExpr::old_row(fk),
            ),
            TriggerEvent::Delete => (ValueExpr::old_row(fk), ValueExpr::old_row(fk)),
        };
        let guard = object_id.is_not_null();

        Ok(dirty::enqueue(&self.owner.content_type(), object_id, old_object_id)?.only_if(guard))
    }
}

#[cfg(test)]
mod tests {
    use crate::dependency::{Dependency, DependencyDeclaration};
    use crate::error::testing::assert_error_sqlstate;
    use crate::model::{Model, ModelRegistry, RelationKind};
    use crate::sql::QualifiedName;

    fn models() -> ModelRegistry {
        let author = QualifiedName::new("public", "author");
        ModelRegistry::new()
            .with(Model::new("public", "author").primary_key("id").column("name", "text"))
            .with(
                Model::new("public", "post")
                    .primary_key("id")
                    .foreign_key("author_id", &author, "id")
                    .column("title", "text"),
            )
    }

    #[test]
    fn test_three_triggers_on_source() {
        let resolved = Dependency::related("post", "author", None).resolve(&models()).unwrap();
        let triggers = resolved.get_triggers().unwrap();

        let names: Vec<_> = triggers.iter().map(|t| t.name()).collect();
        assert_eq!(
            names,
            vec![
                "denorm_after_row_insert_on_author",
                "denorm_after_row_update_on_author",
                "denorm_after_row_delete_on_author",
            ]
        );
        assert!(triggers.iter().all(|t| t.actions.len() == 1));
    }

    #[test]
    fn test_forward_actions_select_owners() {
        let resolved = Dependency::related("post", "author", None).resolve(&models()).unwrap();
        let triggers = resolved.get_triggers().unwrap();

        assert_eq!(
            triggers[0].statements()[0],
            "INSERT INTO public.denorm_dirty_instance (content_type, object_id, old_object_id) \
             SELECT DISTINCT 'public.post', id, id FROM public.post WHERE author_id = NEW.id \
             ON CONFLICT DO NOTHING;"
        );
        assert!(triggers[1].statements()[0].contains("WHERE author_id = NEW.id"));
        assert!(triggers[2].statements()[0].contains("WHERE author_id = OLD.id"));
    }

    #[test]
    fn test_backward_actions_use_own_foreign_key() {
        let resolved = Dependency::related("author", "post", None).resolve(&models()).unwrap();
        let triggers = resolved.get_triggers().unwrap();

        assert_eq!(triggers[0].subject.name, "post");
        assert_eq!(
            triggers[0].statements()[0],
            "IF NEW.author_id IS NOT NULL THEN \
             INSERT INTO public.denorm_dirty_instance (content_type, object_id, old_object_id) \
             VALUES ('public.author', NEW.author_id, NEW.author_id) ON CONFLICT DO NOTHING; END IF;"
        );
        assert!(triggers[1].statements()[0].contains(
            "VALUES ('public.author', COALESCE(NEW.author_id, OLD.author_id), OLD.author_id)"
        ));
        assert!(triggers[1].statements()[0].starts_with("IF COALESCE(NEW.author_id, OLD.author_id) IS NOT NULL THEN"));
        assert!(triggers[2].statements()[0].contains("VALUES ('public.author', OLD.author_id, OLD.author_id)"));
    }

    #[test]
    fn test_update_trigger_watches_source_columns() {
        let resolved = Dependency::related("author", "post", None).resolve(&models()).unwrap();
        let triggers = resolved.get_triggers().unwrap();

        let condition = triggers[1].condition().unwrap();
        assert!(condition.contains("OLD.author_id IS DISTINCT FROM NEW.author_id"));
        assert!(condition.contains("OLD.title IS DISTINCT FROM NEW.title"));
    }

    #[test]
    fn test_skipped_column_is_not_watched() {
        let resolved = Dependency::Related(DependencyDeclaration::new("post", "author", None).with_skip(["name"]))
            .resolve(&models())
            .unwrap();
        let triggers = resolved.get_triggers().unwrap();

        assert_eq!(triggers[1].condition().unwrap(), "(OLD.id IS DISTINCT FROM NEW.id)");
        assert!(triggers[0].condition().is_none());
    }

    #[test]
    fn test_view_source_is_rejected() {
        let author = QualifiedName::new("public", "author");
        let registry = models().with(
            Model::new("public", "post_feed")
                .kind(RelationKind::View)
                .foreign_key("author_id", &author, "id"),
        );
        let resolved = Dependency::related("author", "post_feed", None).resolve(&registry).unwrap();
        assert_error_sqlstate(resolved.get_triggers(), "42809");
    }
}
