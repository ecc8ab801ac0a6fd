//! Writes the TypeScript declarations for the HTTP API to `shared/types.ts`.

use std::{fs, path::PathBuf};

use ts_rs::TS;

fn generate_types_content() -> String {
    let decls = [
        db::models::artifact::ArtifactType::decl(),
        db::models::artifact::LineageKind::decl(),
        db::models::artifact::EditRecord::decl(),
        db::models::artifact::ContentRef::decl(),
        db::models::artifact::Artifact::decl(),
        db::models::artifact::ForkArtifact::decl(),
        generation::AspectRatio::decl(),
        generation::TargetSpec::decl(),
        generation::FailureKind::decl(),
        generation::ProviderFailure::decl(),
        generation::ProviderStatus::decl(),
        generation::ProviderDescriptor::decl(),
        generation::orchestrator::WirePayload::decl(),
        generation::WireEvent::decl(),
        services::services::navigator::SessionState::decl(),
        services::services::navigator::BatchIntent::decl(),
        services::services::navigator::CommitMode::decl(),
        services::services::navigator::ResultSnapshot::decl(),
        services::services::navigator::BatchSnapshot::decl(),
        services::services::navigator::SessionSnapshot::decl(),
        server::routes::artifacts::LineageView::decl(),
        server::routes::sessions::CreateSessionPayload::decl(),
        server::routes::sessions::MoveCursorPayload::decl(),
        server::routes::sessions::EditPayload::decl(),
        server::routes::sessions::RegeneratePayload::decl(),
        server::routes::sessions::CommitPayload::decl(),
        server::routes::sessions::CommitResponse::decl(),
    ];

    let body = decls
        .into_iter()
        .map(|decl| format!("export {}", decl.trim_start_matches("export ")))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!("// This file was generated by `generate_types`. Do not edit it by hand.\n\n{body}\n")
}

fn main() {
    let check = std::env::args().any(|arg| arg == "--check");
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../shared/types.ts");
    let content = generate_types_content();

    if check {
        match fs::read_to_string(&path) {
            Ok(current) if current == content => println!("shared/types.ts is up to date."),
            _ => {
                eprintln!("shared/types.ts is out of date. Run `cargo run --bin generate_types`.");
                std::process::exit(1);
            }
        }
        return;
    }

    if let Some(dir) = path.parent() {
        if let Err(e) = fs::create_dir_all(dir) {
            eprintln!("Failed to create {}: {}", dir.display(), e);
            std::process::exit(1);
        }
    }
    if let Err(e) = fs::write(&path, content) {
        eprintln!("Failed to write {}: {}", path.display(), e);
        std::process::exit(1);
    }
    println!("Wrote {}", path.display());
}
