use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use atelier_tenancy::TenantContext;
use atelier_tenancy::TenantId;

use crate::SoftDeletable;
use crate::StoreError;
use crate::StoreResult;
use crate::TenantRow;

type Pred<'a, T> = Box<dyn Fn(&T) -> bool + Send + Sync + 'a>;
type UniqueKeyFn<T> = Arc<dyn Fn(&T) -> Option<String> + Send + Sync>;

struct UniqueIndex<T> {
    name: &'static str,
    key_of: UniqueKeyFn<T>,
    entries: HashMap<String, (TenantId, Uuid)>,
}

struct TableState<T> {
    rows: BTreeMap<(TenantId, Uuid), T>,
    uniques: Vec<UniqueIndex<T>>,
}

impl<T> Default for TableState<T> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            uniques: Vec::new(),
        }
    }
}

/// Tenant-aware table for one entity type. Every operation injects the
/// ambient tenant into its key and refuses rows whose `tenant_id` does
/// not match the context, so an unscoped read or a cross-tenant write is
/// unrepresentable through this interface.
pub struct ScopedTable<T: TenantRow> {
    name: &'static str,
    state: RwLock<TableState<T>>,
}

impl<T: TenantRow> ScopedTable<T> {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: RwLock::new(TableState::default()),
        }
    }

    /// Declares a unique index maintained on every write. The key
    /// function decides the scope: include the tenant id in the key for
    /// per-tenant uniqueness, omit it for global uniqueness.
    #[must_use]
    pub fn with_unique(
        mut self,
        name: &'static str,
        key_of: impl Fn(&T) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.state.get_mut().uniques.push(UniqueIndex {
            name,
            key_of: Arc::new(key_of),
            entries: HashMap::new(),
        });
        self
    }

    #[must_use]
    pub fn table_name(&self) -> &'static str {
        self.name
    }

    fn ambient() -> StoreResult<TenantId> {
        Ok(TenantContext::require()?.tenant_id)
    }

    fn guard_tenant(&self, row: &T, tenant: TenantId) -> StoreResult<()> {
        if row.tenant_id() != tenant {
            return Err(StoreError::CrossTenant {
                expected: tenant,
                actual: row.tenant_id(),
            });
        }
        Ok(())
    }

    fn check_uniques(
        state: &TableState<T>,
        row: &T,
        own_key: (TenantId, Uuid),
    ) -> StoreResult<()> {
        for index in &state.uniques {
            if let Some(key) = (index.key_of)(row)
                && let Some(owner) = index.entries.get(&key)
                && *owner != own_key
            {
                return Err(StoreError::Conflict {
                    index: index.name.to_string(),
                    key,
                });
            }
        }
        Ok(())
    }

    fn reindex(state: &mut TableState<T>, old: Option<&T>, new: &T, key: (TenantId, Uuid)) {
        for index in &mut state.uniques {
            if let Some(old_row) = old
                && let Some(old_key) = (index.key_of)(old_row)
                && index.entries.get(&old_key) == Some(&key)
            {
                index.entries.remove(&old_key);
            }
            if let Some(new_key) = (index.key_of)(new) {
                index.entries.insert(new_key, key);
            }
        }
    }

    pub async fn insert(&self, row: T) -> StoreResult<T> {
        let tenant = Self::ambient()?;
        self.guard_tenant(&row, tenant)?;

        let mut state = self.state.write().await;
        let key = (tenant, row.id());
        if state.rows.contains_key(&key) {
            return Err(StoreError::Conflict {
                index: format!("{}.primary", self.name),
                key: row.id().to_string(),
            });
        }
        Self::check_uniques(&state, &row, key)?;
        Self::reindex(&mut state, None, &row, key);
        state.rows.insert(key, row.clone());
        Ok(row)
    }

    /// Upserts a row under the ambient tenant.
    pub async fn save(&self, row: T) -> StoreResult<T> {
        let tenant = Self::ambient()?;
        self.guard_tenant(&row, tenant)?;

        let mut state = self.state.write().await;
        let key = (tenant, row.id());
        Self::check_uniques(&state, &row, key)?;
        let previous = state.rows.get(&key).cloned();
        Self::reindex(&mut state, previous.as_ref(), &row, key);
        state.rows.insert(key, row.clone());
        Ok(row)
    }

    pub async fn find_one(&self, id: Uuid) -> StoreResult<Option<T>> {
        let tenant = Self::ambient()?;
        let state = self.state.read().await;
        Ok(state
            .rows
            .get(&(tenant, id))
            .filter(|row| row.deleted_at().is_none())
            .cloned())
    }

    pub async fn get(&self, id: Uuid) -> StoreResult<T> {
        self.find_one(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("{} {id}", self.name)))
    }

    pub async fn find(&self, predicate: impl Fn(&T) -> bool) -> StoreResult<Vec<T>> {
        let tenant = Self::ambient()?;
        let state = self.state.read().await;
        Ok(state
            .rows
            .range((tenant, Uuid::nil())..=(tenant, Uuid::max()))
            .map(|(_, row)| row)
            .filter(|row| row.deleted_at().is_none() && predicate(row))
            .cloned()
            .collect())
    }

    pub async fn count(&self, predicate: impl Fn(&T) -> bool) -> StoreResult<usize> {
        Ok(self.find(predicate).await?.len())
    }

    /// Applies a mutation to one row. The mutation may fail (validation)
    /// in which case nothing is written; the primary key is immutable.
    pub async fn update(
        &self,
        id: Uuid,
        mutate: impl FnOnce(&mut T) -> StoreResult<()>,
    ) -> StoreResult<T> {
        let tenant = Self::ambient()?;
        let mut state = self.state.write().await;
        let key = (tenant, id);
        let current = state
            .rows
            .get(&key)
            .filter(|row| row.deleted_at().is_none())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{} {id}", self.name)))?;

        let mut updated = current.clone();
        mutate(&mut updated)?;
        if updated.id() != id {
            return Err(StoreError::Validation(format!(
                "{} primary key is immutable",
                self.name
            )));
        }
        self.guard_tenant(&updated, tenant)?;
        Self::check_uniques(&state, &updated, key)?;
        Self::reindex(&mut state, Some(&current), &updated, key);
        state.rows.insert(key, updated.clone());
        Ok(updated)
    }

    /// Hard-removes a row under the ambient tenant. Domain rows are
    /// append-only through the service layer; this exists for
    /// compensating rollbacks of a failed multi-row commit.
    pub async fn remove(&self, id: Uuid) -> StoreResult<Option<T>> {
        let tenant = Self::ambient()?;
        let mut state = self.state.write().await;
        let key = (tenant, id);
        let Some(removed) = state.rows.remove(&key) else {
            return Ok(None);
        };
        for index in &mut state.uniques {
            if let Some(index_key) = (index.key_of)(&removed)
                && index.entries.get(&index_key) == Some(&key)
            {
                index.entries.remove(&index_key);
            }
        }
        Ok(Some(removed))
    }

    #[must_use]
    pub fn query(&self) -> Query<'_, T> {
        Query {
            table: self,
            conjuncts: Vec::new(),
            include_deleted: false,
        }
    }

    /// Cross-tenant scan for platform and background pumps only; regular
    /// services must stay on the scoped interface. Usage is gated by the
    /// contract linter allowlist.
    pub async fn unscoped_scan(&self, predicate: impl Fn(&T) -> bool) -> Vec<T> {
        let state = self.state.read().await;
        state
            .rows
            .values()
            .filter(|row| row.deleted_at().is_none() && predicate(row))
            .cloned()
            .collect()
    }
}

impl<T: SoftDeletable> ScopedTable<T> {
    pub async fn soft_delete(&self, id: Uuid) -> StoreResult<T> {
        self.update(id, |row| {
            row.set_deleted_at(Some(Utc::now()));
            Ok(())
        })
        .await
    }
}

/// Read query over the ambient tenant's rows. Conjuncts only; a
/// disjunction is always an explicitly bracketed [`Disjunction`] so the
/// tenant scope can never be widened by a stray `OR`.
pub struct Query<'a, T: TenantRow> {
    table: &'a ScopedTable<T>,
    conjuncts: Vec<Pred<'a, T>>,
    include_deleted: bool,
}

impl<'a, T: TenantRow> Query<'a, T> {
    #[must_use]
    pub fn and_where(mut self, predicate: impl Fn(&T) -> bool + Send + Sync + 'a) -> Self {
        self.conjuncts.push(Box::new(predicate));
        self
    }

    /// Adds a bracketed disjunction as a single conjunct.
    #[must_use]
    pub fn grouped(mut self, build: impl FnOnce(Disjunction<'a, T>) -> Disjunction<'a, T>) -> Self {
        let group = build(Disjunction {
            alternatives: Vec::new(),
        });
        self.conjuncts
            .push(Box::new(move |row| group.matches(row)));
        self
    }

    #[must_use]
    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub async fn fetch(self) -> StoreResult<Vec<T>> {
        let tenant = TenantContext::require()?.tenant_id;
        let state = self.table.state.read().await;
        Ok(state
            .rows
            .range((tenant, Uuid::nil())..=(tenant, Uuid::max()))
            .map(|(_, row)| row)
            .filter(|row| self.include_deleted || row.deleted_at().is_none())
            .filter(|row| self.conjuncts.iter().all(|conjunct| conjunct(row)))
            .cloned()
            .collect())
    }

    pub async fn count(self) -> StoreResult<usize> {
        Ok(self.fetch().await?.len())
    }
}

/// An explicitly bracketed `OR` group. An empty group matches nothing.
pub struct Disjunction<'a, T> {
    alternatives: Vec<Pred<'a, T>>,
}

impl<'a, T> Disjunction<'a, T> {
    #[must_use]
    pub fn or_where(mut self, predicate: impl Fn(&T) -> bool + Send + Sync + 'a) -> Self {
        self.alternatives.push(Box::new(predicate));
        self
    }

    fn matches(&self, row: &T) -> bool {
        self.alternatives.iter().any(|alternative| alternative(row))
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;

    use super::*;
    use atelier_tenancy::ActiveContext;
    use chrono::DateTime;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Clone, PartialEq)]
    struct Note {
        id: Uuid,
        tenant_id: TenantId,
        label: String,
        flagged: bool,
        deleted_at: Option<DateTime<Utc>>,
    }

    impl Note {
        fn new(tenant_id: TenantId, label: &str) -> Self {
            Self {
                id: Uuid::new_v4(),
                tenant_id,
                label: label.into(),
                flagged: false,
                deleted_at: None,
            }
        }
    }

    impl TenantRow for Note {
        fn tenant_id(&self) -> TenantId {
            self.tenant_id
        }

        fn id(&self) -> Uuid {
            self.id
        }

        fn deleted_at(&self) -> Option<DateTime<Utc>> {
            self.deleted_at
        }
    }

    impl SoftDeletable for Note {
        fn set_deleted_at(&mut self, deleted_at: Option<DateTime<Utc>>) {
            self.deleted_at = deleted_at;
        }
    }

    fn notes_table() -> ScopedTable<Note> {
        ScopedTable::new("notes").with_unique("notes.label", |note: &Note| {
            Some(format!("{}:{}", note.tenant_id, note.label))
        })
    }

    async fn scoped<F: Future>(tenant: TenantId, future: F) -> F::Output {
        TenantContext::scope(ActiveContext::new(tenant), future).await
    }

    #[tokio::test]
    async fn refuses_work_without_context() {
        let table = notes_table();
        let err = table.find(|_| true).await.unwrap_err();
        assert!(matches!(err, StoreError::ContextMissing(_)));
    }

    #[tokio::test]
    async fn rejects_rows_from_another_tenant() {
        let table = notes_table();
        let ambient = Uuid::new_v4();
        let foreign = Uuid::new_v4();

        let err = scoped(ambient, table.insert(Note::new(foreign, "a")))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CrossTenant { .. }));
    }

    #[tokio::test]
    async fn reads_are_isolated_per_tenant() {
        let table = notes_table();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        scoped(first, table.insert(Note::new(first, "one")))
            .await
            .expect("insert first");
        scoped(second, table.insert(Note::new(second, "two")))
            .await
            .expect("insert second");

        let seen = scoped(first, table.find(|_| true)).await.expect("find");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].label, "one");
    }

    #[tokio::test]
    async fn unique_index_raises_conflict() {
        let table = notes_table();
        let tenant = Uuid::new_v4();

        scoped(tenant, table.insert(Note::new(tenant, "dup")))
            .await
            .expect("first insert");
        let err = scoped(tenant, table.insert(Note::new(tenant, "dup")))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        // Same label under another tenant is fine: the key includes the tenant.
        let other = Uuid::new_v4();
        scoped(other, table.insert(Note::new(other, "dup")))
            .await
            .expect("other tenant insert");
    }

    #[tokio::test]
    async fn soft_deleted_rows_leave_default_reads() {
        let table = notes_table();
        let tenant = Uuid::new_v4();
        let note = scoped(tenant, table.insert(Note::new(tenant, "gone")))
            .await
            .expect("insert");

        scoped(tenant, table.soft_delete(note.id))
            .await
            .expect("soft delete");

        assert_eq!(
            scoped(tenant, table.find_one(note.id)).await.expect("find"),
            None
        );
        let all = scoped(tenant, table.query().include_deleted().fetch())
            .await
            .expect("fetch");
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn update_keeps_primary_key_immutable() {
        let table = notes_table();
        let tenant = Uuid::new_v4();
        let note = scoped(tenant, table.insert(Note::new(tenant, "stable")))
            .await
            .expect("insert");

        let err = scoped(
            tenant,
            table.update(note.id, |row| {
                row.id = Uuid::new_v4();
                Ok(())
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn grouped_disjunction_stays_inside_tenant_scope() {
        let table = notes_table();
        let tenant = Uuid::new_v4();

        let mut flagged = Note::new(tenant, "flagged");
        flagged.flagged = true;
        scoped(tenant, table.insert(flagged)).await.expect("insert");
        scoped(tenant, table.insert(Note::new(tenant, "plain")))
            .await
            .expect("insert");

        let other = Uuid::new_v4();
        let mut foreign = Note::new(other, "flagged");
        foreign.flagged = true;
        scoped(other, table.insert(foreign)).await.expect("insert");

        let rows = scoped(
            tenant,
            table
                .query()
                .grouped(|group| {
                    group
                        .or_where(|note: &Note| note.flagged)
                        .or_where(|note: &Note| note.label == "plain")
                })
                .fetch(),
        )
        .await
        .expect("fetch");
        assert_eq!(rows.len(), 2);
    }
}
