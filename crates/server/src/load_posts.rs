//! Seed the feed with posts from `posts.txt`, one `lat<TAB>lon<TAB>content` per line.

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::env;

const SEED_AUTHOR: &str = "seed";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let db = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&db).await?;

    println!("Connected to database!");

    let posts_content = std::fs::read_to_string("posts.txt")
        .context("Failed to read posts.txt - make sure it exists!")?;

    let mut count = 0;
    let mut skipped = 0;

    for (number, line) in posts_content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.splitn(3, '\t');
        let (Some(lat), Some(lon), Some(content)) = (fields.next(), fields.next(), fields.next())
        else {
            println!("✗ Line {}: expected lat, lon and content", number + 1);
            skipped += 1;
            continue;
        };
        let (Ok(lat), Ok(lon)) = (lat.trim().parse::<f64>(), lon.trim().parse::<f64>()) else {
            println!("✗ Line {}: invalid coordinates", number + 1);
            skipped += 1;
            continue;
        };
        if hyperlocal::geo::check_coordinates(lat, lon).is_err() {
            println!("✗ Line {}: coordinates out of range", number + 1);
            skipped += 1;
            continue;
        }
        let content = content.trim();

        // Check if post already exists
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM posts WHERE content = $1 AND lat = $2 AND lon = $3)",
        )
        .bind(content)
        .bind(lat)
        .bind(lon)
        .fetch_one(&db)
        .await?;

        if exists {
            println!("⊘ Skipped (duplicate): {}", content);
            skipped += 1;
            continue;
        }

        sqlx::query("INSERT INTO posts (author_id, content, lat, lon) VALUES ($1, $2, $3, $4)")
            .bind(SEED_AUTHOR)
            .bind(content)
            .bind(lat)
            .bind(lon)
            .execute(&db)
            .await?;

        count += 1;
        println!("✓ Loaded: {}", content);
    }

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✓ Successfully loaded {} new posts!", count);
    if skipped > 0 {
        println!("⊘ Skipped {} lines", skipped);
    }
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");

    Ok(())
}
