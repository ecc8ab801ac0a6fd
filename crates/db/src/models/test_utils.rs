use sqlx::SqlitePool;

use super::artifact::{Artifact, ArtifactType, ContentRef, CreateRootArtifact};
use crate::DBService;

pub(crate) async fn setup_test_pool() -> SqlitePool {
    DBService::new_in_memory()
        .await
        .expect("failed to open sqlite memory db")
        .pool
}

/// Deterministic content reference; distinct seeds give distinct locators.
pub(crate) fn sample_content(seed: &str) -> ContentRef {
    let checksum = format!("{:0>64}", seed.bytes().map(|b| format!("{b:02x}")).collect::<String>());
    ContentRef {
        content_locator: format!("sha256:{checksum}"),
        mime_type: "image/png".into(),
        byte_size: 1024 + seed.len() as i64,
        checksum,
    }
}

pub(crate) async fn create_test_root(pool: &SqlitePool) -> Artifact {
    Artifact::create_root(
        pool,
        &CreateRootArtifact {
            artifact_type: ArtifactType::Image,
            content: sample_content("root"),
        },
    )
    .await
    .expect("failed to create test root")
}
