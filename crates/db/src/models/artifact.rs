use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type, types::Json};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LineageError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Artifact {0} not found")]
    NotFound(Uuid),
    #[error("Artifact {parent_id} already has a successor; re-fetch the tip and retry")]
    VersionConflict { parent_id: Uuid },
    #[error("Broken lineage chain for {leaf_id}: {reason}")]
    BrokenChain { leaf_id: Uuid, reason: String },
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, TS, PartialEq, Eq, Default)]
#[sqlx(type_name = "artifact_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    #[default]
    Image,
    Video,
}

impl ArtifactType {
    /// The artifact type for content of `mime_type`, if it is media at all.
    pub fn from_mime_type(mime_type: &str) -> Option<Self> {
        if mime_type.starts_with("image/") {
            Some(ArtifactType::Image)
        } else if mime_type.starts_with("video/") {
            Some(ArtifactType::Video)
        } else {
            None
        }
    }
}

impl std::fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactType::Image => write!(f, "image"),
            ArtifactType::Video => write!(f, "video"),
        }
    }
}

/// How a record entered the store.
#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, TS, PartialEq, Eq)]
#[sqlx(type_name = "lineage_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LineageKind {
    /// Version 1 from an upload or a fresh generation
    Root,
    /// Conflict-checked successor; at most one per parent
    Append,
    /// Intentional sibling (regenerate, or an edit of a non-tip version)
    Branch,
    /// Independent root whose content was derived from another artifact
    Fork,
}

impl std::fmt::Display for LineageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LineageKind::Root => write!(f, "root"),
            LineageKind::Append => write!(f, "append"),
            LineageKind::Branch => write!(f, "branch"),
            LineageKind::Fork => write!(f, "fork"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS, PartialEq)]
pub struct EditRecord {
    pub instruction: String,
    #[ts(type = "Date")]
    pub timestamp: DateTime<Utc>,
    pub provider_id: Option<String>,
    pub previous_artifact_id: Uuid,
}

/// Where the bytes of an artifact live. The bytes themselves never enter the
/// lineage store.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS, PartialEq, Eq)]
pub struct ContentRef {
    pub content_locator: String,
    pub mime_type: String,
    pub byte_size: i64,
    pub checksum: String,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS, PartialEq)]
pub struct Artifact {
    pub id: Uuid,
    pub artifact_type: ArtifactType,
    pub version: i64,
    pub parent_artifact_id: Option<Uuid>,
    pub root_artifact_id: Uuid,
    pub forked_from_id: Option<Uuid>,
    pub lineage_kind: LineageKind,
    #[ts(type = "Array<EditRecord>")]
    pub edit_history: Json<Vec<EditRecord>>,
    #[sqlx(flatten)]
    pub content: ContentRef,
    #[ts(type = "Date")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct CreateRootArtifact {
    #[serde(default)]
    pub artifact_type: ArtifactType,
    pub content: ContentRef,
}

/// A committed edit: the new content plus the instruction that produced it.
#[derive(Debug, Clone, Deserialize, TS)]
pub struct NewVersion {
    pub content: ContentRef,
    pub instruction: String,
    #[ts(optional)]
    pub provider_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, TS)]
pub struct ForkArtifact {
    /// Content for the new root; the source's content is reused when absent.
    #[ts(optional)]
    pub content: Option<ContentRef>,
}

impl Artifact {
    pub fn is_root(&self) -> bool {
        self.parent_artifact_id.is_none()
    }

    pub fn edits(&self) -> &[EditRecord] {
        &self.edit_history.0
    }

    /// The edit that produced this version, if it is not a root.
    pub fn last_edit(&self) -> Option<&EditRecord> {
        self.edit_history.0.last()
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Artifact>(r#"SELECT * FROM artifacts WHERE id = ?"#)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn get(pool: &SqlitePool, id: Uuid) -> Result<Self, LineageError> {
        Self::find_by_id(pool, id)
            .await?
            .ok_or(LineageError::NotFound(id))
    }

    pub async fn create_root(
        pool: &SqlitePool,
        data: &CreateRootArtifact,
    ) -> Result<Self, LineageError> {
        let id = Uuid::new_v4();
        let artifact = sqlx::query_as::<_, Artifact>(
            r#"
            INSERT INTO artifacts (
                id, artifact_type, version, parent_artifact_id, root_artifact_id,
                forked_from_id, lineage_kind, edit_history,
                content_locator, mime_type, byte_size, checksum, created_at
            )
            VALUES (?, ?, 1, NULL, ?, NULL, 'root', '[]', ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(data.artifact_type)
        .bind(id)
        .bind(&data.content.content_locator)
        .bind(&data.content.mime_type)
        .bind(data.content.byte_size)
        .bind(&data.content.checksum)
        .bind(Utc::now())
        .fetch_one(pool)
        .await?;

        tracing::info!(artifact_id = %artifact.id, "Created lineage root");
        Ok(artifact)
    }

    /// Commit a new tip on top of `parent_id`.
    ///
    /// Fails with `VersionConflict` when the parent already has an appended
    /// successor, so two racing editors of the same tip never both win.
    pub async fn append(
        pool: &SqlitePool,
        parent_id: Uuid,
        data: &NewVersion,
    ) -> Result<Self, LineageError> {
        Self::insert_successor(pool, parent_id, data, LineageKind::Append).await
    }

    /// Commit a sibling under `parent_id` without the successor check.
    pub async fn branch(
        pool: &SqlitePool,
        parent_id: Uuid,
        data: &NewVersion,
    ) -> Result<Self, LineageError> {
        Self::insert_successor(pool, parent_id, data, LineageKind::Branch).await
    }

    async fn insert_successor(
        pool: &SqlitePool,
        parent_id: Uuid,
        data: &NewVersion,
        kind: LineageKind,
    ) -> Result<Self, LineageError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let record = EditRecord {
            instruction: data.instruction.clone(),
            timestamp: now,
            provider_id: data.provider_id.clone(),
            previous_artifact_id: parent_id,
        };
        let record_json = serde_json::to_string(&record)?;

        // Version and history derive from the parent row inside the same
        // statement, so the write is atomic and a missing parent inserts nothing.
        let inserted = sqlx::query_as::<_, Artifact>(
            r#"
            INSERT INTO artifacts (
                id, artifact_type, version, parent_artifact_id, root_artifact_id,
                forked_from_id, lineage_kind, edit_history,
                content_locator, mime_type, byte_size, checksum, created_at
            )
            SELECT
                ?, parent.artifact_type, parent.version + 1, parent.id, parent.root_artifact_id,
                NULL, ?, json_insert(parent.edit_history, '$[#]', json(?)),
                ?, ?, ?, ?, ?
            FROM artifacts AS parent
            WHERE parent.id = ?
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(kind)
        .bind(record_json)
        .bind(&data.content.content_locator)
        .bind(&data.content.mime_type)
        .bind(data.content.byte_size)
        .bind(&data.content.checksum)
        .bind(now)
        .bind(parent_id)
        .fetch_optional(pool)
        .await;

        match inserted {
            Ok(Some(artifact)) => {
                tracing::info!(
                    artifact_id = %artifact.id,
                    parent_id = %parent_id,
                    version = artifact.version,
                    kind = %kind,
                    "Committed artifact version"
                );
                Ok(artifact)
            }
            Ok(None) => Err(LineageError::NotFound(parent_id)),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                tracing::warn!(parent_id = %parent_id, "Rejected racing append");
                Err(LineageError::VersionConflict { parent_id })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Start an independent lineage from `source_id`'s content.
    pub async fn fork(
        pool: &SqlitePool,
        source_id: Uuid,
        data: &ForkArtifact,
    ) -> Result<Self, LineageError> {
        let id = Uuid::new_v4();
        let content = data.content.as_ref();
        let forked = sqlx::query_as::<_, Artifact>(
            r#"
            INSERT INTO artifacts (
                id, artifact_type, version, parent_artifact_id, root_artifact_id,
                forked_from_id, lineage_kind, edit_history,
                content_locator, mime_type, byte_size, checksum, created_at
            )
            SELECT
                ?, source.artifact_type, 1, NULL, ?,
                source.id, 'fork', '[]',
                COALESCE(?, source.content_locator),
                COALESCE(?, source.mime_type),
                COALESCE(?, source.byte_size),
                COALESCE(?, source.checksum),
                ?
            FROM artifacts AS source
            WHERE source.id = ?
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(id)
        .bind(content.map(|c| c.content_locator.as_str()))
        .bind(content.map(|c| c.mime_type.as_str()))
        .bind(content.map(|c| c.byte_size))
        .bind(content.map(|c| c.checksum.as_str()))
        .bind(Utc::now())
        .bind(source_id)
        .fetch_optional(pool)
        .await?
        .ok_or(LineageError::NotFound(source_id))?;

        tracing::info!(artifact_id = %forked.id, source_id = %source_id, "Forked artifact");
        Ok(forked)
    }

    /// Ancestor path of `leaf_id`, root first.
    pub async fn get_chain(pool: &SqlitePool, leaf_id: Uuid) -> Result<Vec<Self>, LineageError> {
        let leaf = Self::get(pool, leaf_id).await?;
        let mut visited = HashSet::from([leaf.id]);
        let mut chain = vec![leaf];

        while let Some(parent_id) = chain.last().and_then(|a| a.parent_artifact_id) {
            if !visited.insert(parent_id) {
                return Err(broken_chain(leaf_id, format!("cycle through {parent_id}"), &chain));
            }
            let Some(parent) = Self::find_by_id(pool, parent_id).await? else {
                return Err(broken_chain(
                    leaf_id,
                    format!("missing ancestor {parent_id}"),
                    &chain,
                ));
            };
            chain.push(parent);
        }

        chain.reverse();
        verify_chain(leaf_id, &chain)?;
        Ok(chain)
    }

    /// Direct descendants of `parent_id` in commit order, including branches.
    pub async fn children(pool: &SqlitePool, parent_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Artifact>(
            r#"SELECT * FROM artifacts WHERE parent_artifact_id = ? ORDER BY rowid ASC"#,
        )
        .bind(parent_id)
        .fetch_all(pool)
        .await
    }

    /// Every version descending from `root_id`, ordered by version.
    pub async fn lineage(pool: &SqlitePool, root_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Artifact>(
            r#"SELECT * FROM artifacts WHERE root_artifact_id = ? ORDER BY version ASC, rowid ASC"#,
        )
        .bind(root_id)
        .fetch_all(pool)
        .await
    }

    /// Versions under `root_id` that nothing has been committed on top of.
    pub async fn leaves(pool: &SqlitePool, root_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Artifact>(
            r#"
            SELECT * FROM artifacts AS a
            WHERE a.root_artifact_id = ?
              AND NOT EXISTS (SELECT 1 FROM artifacts AS c WHERE c.parent_artifact_id = a.id)
            ORDER BY a.rowid ASC
            "#,
        )
        .bind(root_id)
        .fetch_all(pool)
        .await
    }

    pub async fn list_roots(pool: &SqlitePool, limit: i64) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Artifact>(
            r#"SELECT * FROM artifacts WHERE parent_artifact_id IS NULL ORDER BY rowid DESC LIMIT ?"#,
        )
        .bind(limit)
        .fetch_all(pool)
        .await
    }
}

fn broken_chain(leaf_id: Uuid, reason: String, walked: &[Artifact]) -> LineageError {
    let walked_ids: Vec<String> = walked.iter().map(|a| a.id.to_string()).collect();
    tracing::error!(
        leaf_id = %leaf_id,
        walked = ?walked_ids,
        "Lineage integrity violation: {}",
        reason
    );
    LineageError::BrokenChain { leaf_id, reason }
}

fn verify_chain(leaf_id: Uuid, chain: &[Artifact]) -> Result<(), LineageError> {
    let Some(root) = chain.first() else {
        return Err(broken_chain(leaf_id, "empty chain".into(), chain));
    };
    if root.version != 1 || !matches!(root.lineage_kind, LineageKind::Root | LineageKind::Fork) {
        return Err(broken_chain(
            leaf_id,
            format!("root {} has version {} ({})", root.id, root.version, root.lineage_kind),
            chain,
        ));
    }

    for artifact in chain {
        if artifact.edits().len() as i64 != artifact.version - 1 {
            return Err(broken_chain(
                leaf_id,
                format!(
                    "{} has {} edits at version {}",
                    artifact.id,
                    artifact.edits().len(),
                    artifact.version
                ),
                chain,
            ));
        }
        if artifact.root_artifact_id != root.id {
            return Err(broken_chain(
                leaf_id,
                format!("{} claims root {}", artifact.id, artifact.root_artifact_id),
                chain,
            ));
        }
    }

    for pair in chain.windows(2) {
        let (parent, child) = (&pair[0], &pair[1]);
        if child.version != parent.version + 1 {
            return Err(broken_chain(
                leaf_id,
                format!(
                    "version step {} -> {} between {} and {}",
                    parent.version, child.version, parent.id, child.id
                ),
                chain,
            ));
        }
    }

    Ok(())
}
