//! PostgreSQL-backed [`Directory`] and [`SessionStore`].
//!
//! Multi-row writes run in a transaction; store errors are mapped to
//! [`ServiceError`] at this boundary.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use uuid::Uuid;

use super::{
    error::ServiceError,
    store::{Directory, SessionStore},
};
use crate::models::{
    MemberRecord, Membership, MembershipHistoryEntry, Organization, Permission, RefreshSession,
    Role, User,
};

/// Database wrapper for all PostgreSQL operations.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database wrapper from a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn insert_history(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    entry: &MembershipHistoryEntry,
) -> Result<(), ServiceError> {
    sqlx::query(
        r#"
        INSERT INTO membership_history
            (entry_id, membership_id, user_id, org_id, role_id, action_code, actor_user_id, created_utc)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(entry.entry_id)
    .bind(entry.membership_id)
    .bind(entry.user_id)
    .bind(entry.org_id)
    .bind(entry.role_id)
    .bind(&entry.action_code)
    .bind(entry.actor_user_id)
    .bind(entry.created_utc)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl Directory for Database {
    async fn health_check(&self) -> Result<(), ServiceError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // ==================== Users ====================

    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, ServiceError> {
        Ok(
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, ServiceError> {
        Ok(
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = LOWER($1)")
                .bind(email)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn insert_user(&self, user: &User) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO users (user_id, email, display_name, password_hash, active_flag, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(user.user_id)
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(&user.password_hash)
        .bind(user.active_flag)
        .bind(user.created_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== Permissions ====================

    async fn find_permission(&self, perm_name: &str) -> Result<Option<Permission>, ServiceError> {
        Ok(
            sqlx::query_as::<_, Permission>("SELECT * FROM permissions WHERE perm_name = $1")
                .bind(perm_name)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn list_permissions(&self) -> Result<Vec<Permission>, ServiceError> {
        Ok(
            sqlx::query_as::<_, Permission>("SELECT * FROM permissions ORDER BY perm_name")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn insert_permission(&self, permission: &Permission) -> Result<(), ServiceError> {
        sqlx::query(
            "INSERT INTO permissions (perm_name, description, created_utc) VALUES ($1, $2, $3)",
        )
        .bind(&permission.perm_name)
        .bind(&permission.description)
        .bind(permission.created_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_permission(&self, perm_name: &str) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;

        let referenced: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM role_permissions WHERE perm_name = $1)",
        )
        .bind(perm_name)
        .fetch_one(&mut *tx)
        .await?;
        if referenced {
            return Err(ServiceError::Conflict(format!(
                "Permission {} is still granted by a role",
                perm_name
            )));
        }

        // role_permissions references permissions with ON DELETE RESTRICT, so a
        // grant added concurrently surfaces as a foreign key violation.
        let result = sqlx::query("DELETE FROM permissions WHERE perm_name = $1")
            .bind(perm_name)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound("Permission".to_string()));
        }

        tx.commit().await?;
        Ok(())
    }

    // ==================== Roles ====================

    async fn find_role(&self, role_id: Uuid) -> Result<Option<Role>, ServiceError> {
        Ok(
            sqlx::query_as::<_, Role>("SELECT * FROM roles WHERE role_id = $1")
                .bind(role_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn list_roles(&self) -> Result<Vec<Role>, ServiceError> {
        Ok(sqlx::query_as::<_, Role>(
            "SELECT * FROM roles ORDER BY role_level DESC, role_name",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    async fn insert_role(&self, role: &Role, permissions: &[String]) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;

        // The partial unique index on role_level = 100 rejects a second
        // super-admin role with a unique violation.
        sqlx::query(
            r#"
            INSERT INTO roles (role_id, role_name, role_level, org_type_codes, created_utc)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(role.role_id)
        .bind(&role.role_name)
        .bind(role.role_level)
        .bind(&role.org_type_codes)
        .bind(role.created_utc)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO role_permissions (role_id, perm_name) SELECT $1, UNNEST($2::TEXT[])",
        )
        .bind(role.role_id)
        .bind(permissions)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn role_permissions(&self, role_id: Uuid) -> Result<Vec<String>, ServiceError> {
        Ok(sqlx::query_scalar(
            "SELECT perm_name FROM role_permissions WHERE role_id = $1 ORDER BY perm_name",
        )
        .bind(role_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn replace_role_permissions(
        &self,
        role_id: Uuid,
        permissions: &[String],
    ) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;

        let locked: Option<Uuid> =
            sqlx::query_scalar("SELECT role_id FROM roles WHERE role_id = $1 FOR UPDATE")
                .bind(role_id)
                .fetch_optional(&mut *tx)
                .await?;
        if locked.is_none() {
            return Err(ServiceError::NotFound("Role".to_string()));
        }

        sqlx::query("DELETE FROM role_permissions WHERE role_id = $1")
            .bind(role_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO role_permissions (role_id, perm_name) SELECT $1, UNNEST($2::TEXT[])",
        )
        .bind(role_id)
        .bind(permissions)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_role(&self, role_id: Uuid) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;

        let assigned: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM memberships WHERE role_id = $1 AND active_flag)",
        )
        .bind(role_id)
        .fetch_one(&mut *tx)
        .await?;
        if assigned {
            return Err(ServiceError::Conflict(
                "Role is still assigned to members".to_string(),
            ));
        }

        let result = sqlx::query("DELETE FROM roles WHERE role_id = $1")
            .bind(role_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound("Role".to_string()));
        }

        tx.commit().await?;
        Ok(())
    }

    // ==================== Organizations ====================

    async fn find_organization(&self, org_id: Uuid) -> Result<Option<Organization>, ServiceError> {
        Ok(
            sqlx::query_as::<_, Organization>("SELECT * FROM organizations WHERE org_id = $1")
                .bind(org_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn find_organization_by_code(
        &self,
        org_code: &str,
    ) -> Result<Option<Organization>, ServiceError> {
        Ok(
            sqlx::query_as::<_, Organization>("SELECT * FROM organizations WHERE org_code = $1")
                .bind(org_code)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn insert_organization(&self, org: &Organization) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO organizations
                (org_id, org_type_code, org_label, org_code, parent_org_id, active_flag, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(org.org_id)
        .bind(&org.org_type_code)
        .bind(&org.org_label)
        .bind(&org.org_code)
        .bind(org.parent_org_id)
        .bind(org.active_flag)
        .bind(org.created_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== Memberships ====================

    async fn find_membership(
        &self,
        membership_id: Uuid,
    ) -> Result<Option<Membership>, ServiceError> {
        Ok(
            sqlx::query_as::<_, Membership>("SELECT * FROM memberships WHERE membership_id = $1")
                .bind(membership_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn find_active_membership(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<Option<Membership>, ServiceError> {
        Ok(sqlx::query_as::<_, Membership>(
            "SELECT * FROM memberships WHERE user_id = $1 AND org_id = $2 AND active_flag",
        )
        .bind(user_id)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn active_memberships_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<Membership>, ServiceError> {
        Ok(sqlx::query_as::<_, Membership>(
            "SELECT * FROM memberships WHERE user_id = $1 AND active_flag ORDER BY created_utc",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn insert_membership(
        &self,
        membership: &Membership,
        entry: &MembershipHistoryEntry,
    ) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;

        // memberships_one_active_per_org turns a duplicate into a unique violation.
        sqlx::query(
            r#"
            INSERT INTO memberships
                (membership_id, user_id, org_id, role_id, active_flag, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(membership.membership_id)
        .bind(membership.user_id)
        .bind(membership.org_id)
        .bind(membership.role_id)
        .bind(membership.active_flag)
        .bind(membership.created_utc)
        .bind(membership.updated_utc)
        .execute(&mut *tx)
        .await?;
        insert_history(&mut tx, entry).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn change_membership_role(
        &self,
        membership_id: Uuid,
        role_id: Uuid,
        entry: &MembershipHistoryEntry,
    ) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE memberships SET role_id = $2, updated_utc = NOW()
            WHERE membership_id = $1 AND active_flag
            "#,
        )
        .bind(membership_id)
        .bind(role_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound("Membership".to_string()));
        }
        insert_history(&mut tx, entry).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn deactivate_membership(
        &self,
        membership_id: Uuid,
        entry: &MembershipHistoryEntry,
    ) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE memberships SET active_flag = FALSE, updated_utc = NOW()
            WHERE membership_id = $1 AND active_flag
            "#,
        )
        .bind(membership_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound("Membership".to_string()));
        }
        insert_history(&mut tx, entry).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_active_members(&self, org_id: Uuid) -> Result<Vec<MemberRecord>, ServiceError> {
        Ok(sqlx::query_as::<_, MemberRecord>(
            r#"
            SELECT m.membership_id, m.user_id, u.email, u.display_name, m.org_id,
                   r.role_id, r.role_name, r.role_level
            FROM memberships m
            JOIN users u ON u.user_id = m.user_id
            JOIN roles r ON r.role_id = m.role_id
            WHERE m.org_id = $1 AND m.active_flag
            ORDER BY r.role_level DESC, u.email
            "#,
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn membership_history(
        &self,
        membership_id: Uuid,
    ) -> Result<Vec<MembershipHistoryEntry>, ServiceError> {
        Ok(sqlx::query_as::<_, MembershipHistoryEntry>(
            "SELECT * FROM membership_history WHERE membership_id = $1 ORDER BY created_utc",
        )
        .bind(membership_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn users_holding_level(&self, role_level: i32) -> Result<Vec<Uuid>, ServiceError> {
        Ok(sqlx::query_scalar(
            r#"
            SELECT DISTINCT m.user_id
            FROM memberships m
            JOIN roles r ON r.role_id = m.role_id
            WHERE m.active_flag AND r.role_level = $1
            "#,
        )
        .bind(role_level)
        .fetch_all(&self.pool)
        .await?)
    }
}

#[async_trait]
impl SessionStore for Database {
    async fn insert_session(&self, session: &RefreshSession) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO refresh_sessions
                (session_id, lineage_id, user_id, org_id, token_hash_text, expiry_utc, revoked_utc, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(session.session_id)
        .bind(session.lineage_id)
        .bind(session.user_id)
        .bind(session.org_id)
        .bind(&session.token_hash_text)
        .bind(session.expiry_utc)
        .bind(session.revoked_utc)
        .bind(session.created_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_session(
        &self,
        session_id: Uuid,
    ) -> Result<Option<RefreshSession>, ServiceError> {
        Ok(sqlx::query_as::<_, RefreshSession>(
            "SELECT * FROM refresh_sessions WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn rotate_session(
        &self,
        current_id: Uuid,
        next: &RefreshSession,
    ) -> Result<bool, ServiceError> {
        let mut tx = self.pool.begin().await?;

        // A concurrent rotation of the same row blocks on the row lock and then
        // re-evaluates the predicate, so exactly one caller sees one row.
        let revoked = sqlx::query(
            r#"
            UPDATE refresh_sessions SET revoked_utc = NOW()
            WHERE session_id = $1 AND revoked_utc IS NULL AND expiry_utc > NOW()
            "#,
        )
        .bind(current_id)
        .execute(&mut *tx)
        .await?;
        if revoked.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO refresh_sessions
                (session_id, lineage_id, user_id, org_id, token_hash_text, expiry_utc, revoked_utc, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(next.session_id)
        .bind(next.lineage_id)
        .bind(next.user_id)
        .bind(next.org_id)
        .bind(&next.token_hash_text)
        .bind(next.expiry_utc)
        .bind(next.revoked_utc)
        .bind(next.created_utc)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn revoke_session(&self, session_id: Uuid) -> Result<bool, ServiceError> {
        let result = sqlx::query(
            r#"
            UPDATE refresh_sessions SET revoked_utc = NOW()
            WHERE session_id = $1 AND revoked_utc IS NULL AND expiry_utc > NOW()
            "#,
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_lineage_active(&self, lineage_id: Uuid) -> Result<bool, ServiceError> {
        Ok(sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM refresh_sessions
                WHERE lineage_id = $1 AND revoked_utc IS NULL AND expiry_utc > NOW()
            )
            "#,
        )
        .bind(lineage_id)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn revoke_lineage(&self, lineage_id: Uuid) -> Result<u64, ServiceError> {
        let result = sqlx::query(
            "UPDATE refresh_sessions SET revoked_utc = NOW() WHERE lineage_id = $1 AND revoked_utc IS NULL",
        )
        .bind(lineage_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn revoke_user_sessions(&self, user_id: Uuid) -> Result<u64, ServiceError> {
        let result = sqlx::query(
            "UPDATE refresh_sessions SET revoked_utc = NOW() WHERE user_id = $1 AND revoked_utc IS NULL",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn set_session_organization(
        &self,
        session_id: Uuid,
        org_id: Option<Uuid>,
    ) -> Result<bool, ServiceError> {
        let result = sqlx::query(
            r#"
            UPDATE refresh_sessions SET org_id = $2
            WHERE session_id = $1 AND revoked_utc IS NULL AND expiry_utc > NOW()
            "#,
        )
        .bind(session_id)
        .bind(org_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
