//! Guard → approve flows against a real Postgres.
//!
//! Run with:
//!   DATABASE_URL="postgresql:///postgres" \
//!   cargo test -p flagguard_postgres --test pg_guard_flow -- --ignored --nocapture
//!
//! Each test creates its own database and drops it afterwards.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use uuid::Uuid;

use flagguard_core::entities::{Feature, GuardEntity, Rule};
use flagguard_core::ports::{GuardPolicy, IdentityVerifier, PermissionsOracle, TotpChallenge};
use flagguard_core::{
    ApprovalCoordinator, ApprovalCredential, ApproveRequest, EntityAction, EntityKind,
    GuardDecision, GuardDecisionService, GuardError, GuardRequest, PendingChangeQuery,
    PendingChangeStatus,
};
use flagguard_postgres::{PgApproverDirectory, PgGuardPolicy, PgGuardStore, MIGRATION_SQL};

const PASSWORD: &str = "correct horse";

struct Identity;

#[async_trait]
impl IdentityVerifier for Identity {
    async fn verify_password(&self, _: Uuid, password: &str) -> anyhow::Result<bool> {
        Ok(password == PASSWORD)
    }

    async fn verify_2fa(&self, _: Uuid, _: Uuid, _: &str, _: &str) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn initiate_totp_approval(
        &self,
        user_id: Uuid,
        pending_change_id: Uuid,
    ) -> anyhow::Result<TotpChallenge> {
        Ok(TotpChallenge {
            session_id: format!("totp-{user_id}-{pending_change_id}"),
            expires_at: Utc::now() + Duration::minutes(5),
        })
    }
}

struct NoManagers;

#[async_trait]
impl PermissionsOracle for NoManagers {
    async fn can_manage_project(&self, _: Uuid, _: Uuid) -> anyhow::Result<bool> {
        Ok(false)
    }
}

// ── Isolated database ─────────────────────────────────────────

struct IsolatedDb {
    pool: PgPool,
    dbname: String,
    admin: PgPool,
}

impl IsolatedDb {
    async fn create() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let admin_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let dbname = format!("flagguard_test_{}", Uuid::new_v4().simple());
        let admin = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(PgConnectOptions::from_str(&admin_url).expect("bad DATABASE_URL"))
            .await
            .expect("admin connect failed");
        sqlx::query(&format!(r#"CREATE DATABASE "{dbname}""#))
            .execute(&admin)
            .await
            .expect("CREATE DATABASE failed");

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_with(
                PgConnectOptions::from_str(&admin_url)
                    .expect("bad DATABASE_URL")
                    .database(&dbname),
            )
            .await
            .expect("test db connect failed");
        sqlx::raw_sql(MIGRATION_SQL)
            .execute(&pool)
            .await
            .expect("migration failed");
        Self { pool, dbname, admin }
    }

    async fn cleanup(self) {
        self.pool.close().await;
        let _ = sqlx::query(&format!(r#"DROP DATABASE IF EXISTS "{}""#, self.dbname))
            .execute(&self.admin)
            .await;
    }
}

// ── Fixture ───────────────────────────────────────────────────

struct Fixture {
    db: IsolatedDb,
    guard: GuardDecisionService,
    approval: ApprovalCoordinator,
    feature: Feature,
    environment_id: Uuid,
    approver: Uuid,
    outsider: Uuid,
}

async fn fixture(guarded: bool) -> Fixture {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let db = IsolatedDb::create().await;
    let pool = db.pool.clone();

    let feature = Feature {
        id: Uuid::new_v4(),
        project_id: Uuid::new_v4(),
        key: "checkout-v2".into(),
        name: "Old".into(),
        description: "new checkout".into(),
        rollout_key: "user_id".into(),
        value_type: "boolean".into(),
        permanent: false,
        params: None,
    };
    sqlx::query(
        r#"
        INSERT INTO features (id, project_id, key, name, description, rollout_key, value_type,
                              permanent, guarded)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(feature.id)
    .bind(feature.project_id)
    .bind(&feature.key)
    .bind(&feature.name)
    .bind(&feature.description)
    .bind(&feature.rollout_key)
    .bind(&feature.value_type)
    .bind(feature.permanent)
    .bind(guarded)
    .execute(&pool)
    .await
    .expect("seed feature");

    let (approver, outsider) = (Uuid::new_v4(), Uuid::new_v4());
    for (id, name) in [(approver, "bob"), (outsider, "mallory")] {
        sqlx::query("INSERT INTO users (id, name) VALUES ($1, $2)")
            .bind(id)
            .bind(name)
            .execute(&pool)
            .await
            .expect("seed user");
        sqlx::query("INSERT INTO project_members (project_id, user_id) VALUES ($1, $2)")
            .bind(feature.project_id)
            .bind(id)
            .execute(&pool)
            .await
            .expect("seed member");
    }
    sqlx::query("INSERT INTO project_approvers (project_id, user_id) VALUES ($1, $2)")
        .bind(feature.project_id)
        .bind(approver)
        .execute(&pool)
        .await
        .expect("seed approver");

    let store = Arc::new(PgGuardStore::new(pool.clone()));
    let guard = GuardDecisionService::new(store.clone(), Arc::new(PgGuardPolicy::new(pool.clone())));
    let approval = ApprovalCoordinator::new(
        store,
        Arc::new(Identity),
        Arc::new(NoManagers),
        Arc::new(PgApproverDirectory::new(pool)),
    );

    Fixture {
        db,
        guard,
        approval,
        feature,
        environment_id: Uuid::new_v4(),
        approver,
        outsider,
    }
}

impl Fixture {
    fn rename(&self, name: &str) -> GuardRequest {
        let new = Feature {
            name: name.into(),
            ..self.feature.clone()
        };
        GuardRequest {
            project_id: self.feature.project_id,
            environment_id: self.environment_id,
            feature_id: self.feature.id,
            reason: "release prep".into(),
            origin: "dashboard".into(),
            action: EntityAction::Update,
            old_entity: Some(GuardEntity::from(&self.feature)),
            new_entity: Some(GuardEntity::from(new)),
            requested_by: "alice".into(),
            requested_user_id: Some(Uuid::new_v4()),
        }
    }

    fn approve(&self, id: Uuid, user: Uuid) -> ApproveRequest {
        ApproveRequest {
            pending_change_id: id,
            approver_user_id: user,
            approver_name: "bob".into(),
            credential: ApprovalCredential::Password {
                password: PASSWORD.into(),
            },
        }
    }

    async fn feature_name(&self) -> String {
        sqlx::query_scalar("SELECT name FROM features WHERE id = $1")
            .bind(self.feature.id)
            .fetch_one(&self.db.pool)
            .await
            .expect("feature name")
    }
}

// ── Tests ─────────────────────────────────────────────────────

#[tokio::test]
#[ignore]
async fn unguarded_feature_proceeds() {
    let fx = fixture(false).await;
    let decision = fx.guard.check_guarded_operation(fx.rename("New")).await.unwrap();
    assert!(decision.proceed());
    fx.db.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn guarded_rename_is_approved_and_applied() {
    let fx = fixture(true).await;
    let decision = fx.guard.check_guarded_operation(fx.rename("New")).await.unwrap();
    let pending = decision.pending_change().expect("pending").clone();
    // Two active members: not a single-user project.
    assert!(!pending.change.meta.single_user_project);

    let stored = fx.approval.get_by_id(pending.id).await.unwrap();
    assert_eq!(stored.change, pending.change);
    assert_eq!(fx.feature_name().await, "Old");

    let approved = fx
        .approval
        .approve(fx.approve(pending.id, fx.approver))
        .await
        .unwrap();
    assert_eq!(approved.status, PendingChangeStatus::Approved);
    assert_eq!(approved.approved_user_id, Some(fx.approver));
    assert_eq!(fx.feature_name().await, "New");

    let scope_rows: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM pending_change_scope WHERE pending_change_id = $1")
            .bind(pending.id)
            .fetch_one(&fx.db.pool)
            .await
            .unwrap();
    assert_eq!(scope_rows, 0);
    fx.db.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn overlapping_proposal_conflicts_until_rejected() {
    let fx = fixture(true).await;
    let first = fx.guard.check_guarded_operation(fx.rename("A")).await.unwrap();
    let first = first.pending_change().expect("pending").clone();

    match fx.guard.check_guarded_operation(fx.rename("B")).await.unwrap() {
        GuardDecision::Conflict { conflicting } => {
            assert_eq!(conflicting.len(), 1);
            assert_eq!(conflicting[0].pending_change_id, first.id);
            assert_eq!(conflicting[0].keys[0].kind, EntityKind::Feature);
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    fx.approval
        .reject(first.id, fx.approver, "bob", Some("not yet".into()))
        .await
        .unwrap();
    let retry = fx.guard.check_guarded_operation(fx.rename("B")).await.unwrap();
    assert!(retry.pending_change().is_some());
    fx.db.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn concurrent_proposals_yield_one_pending() {
    let fx = fixture(true).await;
    let (a, b) = tokio::join!(
        fx.guard.check_guarded_operation(fx.rename("A")),
        fx.guard.check_guarded_operation(fx.rename("B")),
    );
    let decisions = [a.unwrap(), b.unwrap()];
    let pending = decisions
        .iter()
        .filter(|d| d.pending_change().is_some())
        .count();
    let conflicts = decisions.iter().filter(|d| d.conflict()).count();
    assert_eq!((pending, conflicts), (1, 1));
    fx.db.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn failed_apply_leaves_change_pending() {
    let fx = fixture(true).await;
    let rule = Rule {
        id: Uuid::new_v4(),
        feature_id: fx.feature.id,
        project_id: fx.feature.project_id,
        environment_id: fx.environment_id,
        name: "beta users".into(),
        priority: 1,
        value: "true".into(),
        rollout_percent: 50.0,
        condition: None,
    };
    // Update of a rule that was never inserted: approval must fail whole.
    let request = GuardRequest {
        action: EntityAction::Update,
        old_entity: Some(GuardEntity::from(&rule)),
        new_entity: Some(GuardEntity::from(Rule {
            priority: 2,
            ..rule.clone()
        })),
        ..fx.rename("unused")
    };
    let decision = fx.guard.check_guarded_operation(request).await.unwrap();
    let pending = decision.pending_change().expect("pending").clone();

    let err = fx
        .approval
        .approve(fx.approve(pending.id, fx.approver))
        .await
        .unwrap_err();
    assert!(matches!(err, GuardError::ApplyFailed { .. }), "{err:?}");
    let reloaded = fx.approval.get_by_id(pending.id).await.unwrap();
    assert_eq!(reloaded.status, PendingChangeStatus::Pending);
    fx.db.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn outsider_cannot_approve_and_listing_filters() {
    let fx = fixture(true).await;
    let decision = fx.guard.check_guarded_operation(fx.rename("New")).await.unwrap();
    let pending = decision.pending_change().expect("pending").clone();

    let err = fx
        .approval
        .approve(fx.approve(pending.id, fx.outsider))
        .await
        .unwrap_err();
    assert!(matches!(err, GuardError::NotAnApprover { .. }), "{err:?}");

    let page = fx
        .approval
        .list(&PendingChangeQuery {
            project_id: Some(fx.feature.project_id),
            status: Some(PendingChangeStatus::Pending),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].id, pending.id);

    let none = fx
        .approval
        .list(&PendingChangeQuery {
            project_id: Some(fx.feature.project_id),
            status: Some(PendingChangeStatus::Approved),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(none.total, 0);
    fx.db.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn entity_guard_resolves_through_owning_feature() {
    let fx = fixture(true).await;
    let policy = PgGuardPolicy::new(fx.db.pool.clone());
    let rule_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO rules (id, feature_id, project_id, environment_id, name, priority, value,
                           rollout_percent)
        VALUES ($1, $2, $3, $4, 'beta', 1, 'on', 50)
        "#,
    )
    .bind(rule_id)
    .bind(fx.feature.id)
    .bind(fx.feature.project_id)
    .bind(fx.environment_id)
    .execute(&fx.db.pool)
    .await
    .expect("seed rule");

    assert!(policy
        .is_entity_guarded(EntityKind::Rule, rule_id)
        .await
        .unwrap());
    assert!(policy
        .is_entity_guarded(EntityKind::FeatureParams, fx.feature.id)
        .await
        .unwrap());
    assert!(policy
        .is_entity_guarded(EntityKind::Rule, Uuid::new_v4())
        .await
        .is_err());
    // An unattached tag belongs to no guarded feature.
    assert!(!policy
        .is_entity_guarded(EntityKind::FeatureTagRelation, Uuid::new_v4())
        .await
        .unwrap());
    fx.db.cleanup().await;
}
