use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{ClientConfig, SyncClient, UploadInput, UploadPhase};
use shared::domain::{FileId, FolderId, UserId};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:3001")]
    server_url: String,
    #[arg(long)]
    user_id: i64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print events pushed to this user until interrupted.
    Watch,
    /// Upload a file and wait until the server has recorded it.
    Upload {
        path: PathBuf,
        #[arg(long)]
        mime_type: Option<String>,
        #[arg(long)]
        folder_id: Option<i64>,
    },
    /// List the user's newest files.
    List {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// List the user's folders.
    Folders,
    /// Create a folder.
    Mkdir { name: String },
    /// Move files into a folder, or back to the root without `--folder-id`.
    Mv {
        #[arg(required = true)]
        file_ids: Vec<i64>,
        #[arg(long)]
        folder_id: Option<i64>,
    },
    /// Delete files here and at the storage vendor.
    Rm {
        #[arg(required = true)]
        file_ids: Vec<i64>,
    },
    /// Delete folders together with the files in them.
    Rmdir {
        #[arg(required = true)]
        folder_ids: Vec<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();
    let client = SyncClient::start(ClientConfig::new(args.server_url, UserId(args.user_id)))?;

    match args.command {
        Command::Watch => watch(&client).await,
        Command::Upload {
            path,
            mime_type,
            folder_id,
        } => upload(&client, &path, mime_type, folder_id.map(FolderId)).await,
        Command::List { limit } => {
            let page = client.api.list_files(limit, 0).await?;
            for file in &page.files {
                println!(
                    "{}\t{}\t{}\t{} bytes\t{}",
                    file.file_id, file.file_key, file.name, file.size_bytes, file.url
                );
            }
            if page.has_next {
                println!("(more files available)");
            }
            Ok(())
        }
        Command::Folders => {
            for folder in client.api.list_folders().await? {
                println!("{}\t{}", folder.folder_id, folder.name);
            }
            Ok(())
        }
        Command::Mkdir { name } => {
            let folder = client.api.create_folder(&name).await?;
            println!("created folder {} ({})", folder.name, folder.folder_id);
            Ok(())
        }
        Command::Mv {
            file_ids,
            folder_id,
        } => {
            let file_ids: Vec<FileId> = file_ids.into_iter().map(FileId).collect();
            client
                .api
                .move_files(&file_ids, folder_id.map(FolderId))
                .await
        }
        Command::Rm { file_ids } => {
            let file_ids: Vec<FileId> = file_ids.into_iter().map(FileId).collect();
            client.api.delete_files(&file_ids).await
        }
        Command::Rmdir { folder_ids } => {
            let folder_ids: Vec<FolderId> = folder_ids.into_iter().map(FolderId).collect();
            client.api.delete_folders(&folder_ids).await
        }
    }
}

async fn watch(client: &SyncClient) -> Result<()> {
    let mut events = client.bus.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "terminal fell behind"),
                Err(RecvError::Closed) => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

async fn upload(
    client: &SyncClient,
    path: &Path,
    mime_type: Option<String>,
    folder_id: Option<FolderId>,
) -> Result<()> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .context("path has no usable file name")?
        .to_string();
    let mime_type = mime_type.unwrap_or_else(|| guess_mime_type(path).to_string());

    let mut handle = client.uploads.start(UploadInput {
        file_name,
        mime_type,
        folder_id,
        bytes,
    });
    let id = handle.id;

    loop {
        let phase = handle.status.borrow_and_update().clone();
        println!("{phase:?}");
        if phase.is_terminal() {
            break;
        }
        tokio::select! {
            changed = handle.status.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                client.uploads.cancel(id);
            }
        }
    }

    match handle.finished().await {
        UploadPhase::Done { file_key } => {
            if let Some(file) = client.sync.catalog().get(&file_key).await {
                println!("uploaded {} -> {}", file.name, file.url);
            }
            Ok(())
        }
        UploadPhase::Cancelled => Ok(()),
        other => anyhow::bail!("upload did not complete: {other:?}"),
    }
}

fn guess_mime_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("pdf") => "application/pdf",
        Some("txt" | "md") => "text/plain",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}
