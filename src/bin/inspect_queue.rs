use mailq::config::{Config, DEFAULT_CONFIG_PATH};
use mailq::{Database, QueueStore};
use std::env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <search_query>", args[0]);
        eprintln!("Search query matches against Subject or Authors.");
        std::process::exit(1);
    }

    let query = &args[1];
    let config = Config::load(DEFAULT_CONFIG_PATH);
    let db = Database::new(&config.database.url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;

    let Some(task) = db.search(query).await? else {
        println!("No emails found matching '{}'", query);
        return Ok(());
    };

    println!("Found Email:");
    println!("ID: {}", task.id);
    println!("Status: {}", task.status);
    println!("Priority: {}", task.priority);
    println!("Retries: {}", task.retry_count);
    println!("Created: {}", task.created_at);
    println!("Sent: {:?}", task.sent_at);
    println!("Subject: {:?}", task.subject);
    println!("Authors: {:?}", task.authors);
    println!("Recipients: {:?}", task.recipients);
    println!("Context: {:?} {:?}", task.context, task.context_identifier);
    println!("Last error: {:?}", task.last_error);
    println!(
        "--------------------------------------------------------------------------------"
    );

    for header in db.load_headers(task.id).await? {
        println!("{}: {}", header.name, header.value);
    }
    for (i, part) in db.load_parts(task.id).await?.iter().enumerate() {
        println!(
            "PART {}: {} ({} bytes) disposition={:?} filename={:?} charset={:?}",
            i,
            part.mime_type,
            part.contents.len(),
            part.disposition,
            part.filename,
            part.charset
        );
    }

    Ok(())
}
