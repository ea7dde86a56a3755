use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use client_core::{
    remote::RemoteBackend, BookmarkStore, ChangeFeed, LiveBookmarkStore, SessionService,
    StoreEvent,
};
use shared::domain::{Bookmark, BookmarkId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

/// Terminal front end for the shared bookmark list: sign in, watch the list
/// update live, add and remove links.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    #[arg(long)]
    email: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let backend = RemoteBackend::new(&args.server_url)?;
    let principal = backend.sign_in(&args.email).await?;
    println!("signed in as {} ({})", principal.email, principal.user_id);

    let store = LiveBookmarkStore::connect(
        Arc::clone(&backend) as Arc<dyn SessionService>,
        Arc::clone(&backend) as Arc<dyn BookmarkStore>,
        Arc::clone(&backend) as Arc<dyn ChangeFeed>,
    )
    .await?;

    let initial = store.load_all().await?;
    print_list(&initial);

    let mut events = store.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                StoreEvent::Inserted(bookmark) => {
                    println!("+ {}", format_bookmark(&bookmark));
                }
                StoreEvent::Removed(id) => println!("- removed #{id}"),
                StoreEvent::Reloaded { count } => println!("(reloaded, {count} bookmarks)"),
                StoreEvent::FeedClosed => println!("(change feed closed; `ls` to refresh)"),
            }
        }
    });

    println!("commands: add <url> <title...> | rm <id> | ls | quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        match command {
            "" => {}
            "add" => {
                let (url, title) = rest.split_once(' ').unwrap_or((rest, ""));
                let title = if title.trim().is_empty() { url } else { title };
                match store.create(title, url).await {
                    Ok(bookmark) => println!("saved #{}", bookmark.id),
                    Err(err) => warn!(error = %err, "create failed"),
                }
            }
            "rm" => match rest.trim().parse::<i64>() {
                Ok(id) => {
                    if let Err(err) = store.delete(BookmarkId(id)).await {
                        warn!(error = %err, "delete failed");
                    }
                }
                Err(_) => println!("usage: rm <id>"),
            },
            "ls" => match store.load_all().await {
                Ok(bookmarks) => print_list(&bookmarks),
                Err(err) => warn!(error = %err, "reload failed"),
            },
            "quit" | "exit" => break,
            other => println!("unknown command: {other}"),
        }
    }

    printer.abort();
    store.shutdown().await;
    backend.sign_out().await?;
    println!("signed out");
    Ok(())
}

fn print_list(bookmarks: &[Bookmark]) {
    if bookmarks.is_empty() {
        println!("(no bookmarks)");
        return;
    }
    for bookmark in bookmarks {
        println!("  {}", format_bookmark(bookmark));
    }
}

fn format_bookmark(bookmark: &Bookmark) -> String {
    format!(
        "#{} {} <{}>",
        bookmark.id, bookmark.title, bookmark.url
    )
}
