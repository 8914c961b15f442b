use docpipe::store::{JobFilter, Scope};
use sqlx::{Postgres, QueryBuilder};

use crate::types::{JobStatus, COLUMNS};

pub(crate) trait ToQuery {
    fn select(&self) -> QueryBuilder<'_, Postgres>;
    fn count(&self) -> QueryBuilder<'_, Postgres>;
}

impl ToQuery for JobFilter {
    fn select(&self) -> QueryBuilder<'_, Postgres> {
        let mut builder = QueryBuilder::new("SELECT ");
        builder.push(COLUMNS);
        builder.push(" FROM docpipe_jobs WHERE TRUE");
        push_conditions(&mut builder, self);
        builder.push(" ORDER BY created_at DESC, id DESC");
        builder.push(" LIMIT ");
        builder.push_bind(i64::try_from(self.limit).unwrap_or(i64::MAX));
        builder.push(" OFFSET ");
        builder.push_bind(i64::try_from(self.skip).unwrap_or(i64::MAX));
        builder
    }

    fn count(&self) -> QueryBuilder<'_, Postgres> {
        let mut builder = QueryBuilder::new("SELECT COUNT(*) FROM docpipe_jobs WHERE TRUE");
        push_conditions(&mut builder, self);
        builder
    }
}

fn push_conditions<'a>(builder: &mut QueryBuilder<'a, Postgres>, filter: &'a JobFilter) {
    if let Scope::Owner(user) = &filter.scope {
        builder.push(" AND user_id = ");
        builder.push_bind(user.as_str());
    }
    if !filter.statuses.is_empty() {
        let statuses: Vec<JobStatus> = filter.statuses.iter().copied().map(Into::into).collect();
        builder.push(" AND status = ANY(");
        builder.push_bind(statuses);
        builder.push(")");
    }
    if let Some(before) = filter.updated_before {
        builder.push(" AND updated_at < ");
        builder.push_bind(before);
    }
}

#[cfg(test)]
mod test {
    use docpipe::job::JobStatus;

    use super::*;

    #[test]
    fn owner_scope_and_statuses_are_bound() {
        let filter = JobFilter::new(Scope::Owner("user-1".into()))
            .with_statuses([JobStatus::Processing])
            .paginate(20, 10);

        let sql = filter.select().into_sql();

        assert!(sql.contains("AND user_id = $1"));
        assert!(sql.contains("AND status = ANY($2)"));
        assert!(sql.contains("ORDER BY created_at DESC, id DESC LIMIT $3 OFFSET $4"));
    }

    #[test]
    fn count_ignores_pagination() {
        let filter = JobFilter::new(Scope::Any).paginate(20, 10);

        let sql = filter.count().into_sql();

        assert_eq!(sql, "SELECT COUNT(*) FROM docpipe_jobs WHERE TRUE");
    }
}
