use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use axum::{Router, extract::Query, response::Html, routing::get};
use chrono::{DateTime, Utc};
use colored::*;
use hyperlocal_client::{
    api::{ApiError, Credentials, HttpApi},
    cache::{CacheCoordinator, Notice, View, ViewKey},
    config::{ClientConfig, Login},
};
use hyperlocal_shared::{
    Comment, CommentId, FeedQuery, ListQuery, NewComment, NewPost, Post, PostId, VoteValue,
};
use serde::Deserialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

const CALLBACK_PORT: u16 = 8080;

#[derive(Debug, Deserialize)]
struct CallbackParams {
    access_token: Option<String>,
    error: Option<String>,
}

// ===== Main =====

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let config = ClientConfig::load()?;

    println!("{}", "=".repeat(60).bright_cyan());
    println!("{}", "    📍 WHAT'S HAPPENING NEARBY 📍".bright_yellow().bold());
    println!("{}", "=".repeat(60).bright_cyan());
    println!();

    let credentials = match config.login.clone() {
        Login::Token(token) => Credentials::Bearer(token),
        Login::DevUser(user) => Credentials::DevUser(user),
        Login::Browser { supabase_url } => match authenticate(supabase_url).await {
            Ok(token) => {
                println!("{}", "✅ Authentication successful!".green().bold());
                println!();
                Credentials::Bearer(token)
            }
            Err(e) => {
                eprintln!("{} {}", "❌ Authentication failed:".red().bold(), e);
                return Ok(());
            }
        },
    };

    let api = Arc::new(HttpApi::new(&config.backend_url, credentials));
    let mut coordinator = CacheCoordinator::new(api);
    let notices = coordinator.notices();

    browse(&coordinator, notices, &config).await
}

// ===== Authentication =====

async fn authenticate(supabase_url: String) -> anyhow::Result<String> {
    let token_store: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let callback_store = token_store.clone();

    let app = Router::new().route(
        "/callback",
        get(move |query: Query<CallbackParams>| callback_handler(query, callback_store.clone())),
    );

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", CALLBACK_PORT)).await?;
    let server_handle = tokio::spawn(async move { axum::serve(listener, app).await });

    let auth_url = format!(
        "{}/auth/v1/authorize?provider=discord&redirect_to=http://localhost:{}/callback",
        supabase_url, CALLBACK_PORT
    );

    println!("{}", "Opening browser for Discord login...".yellow());
    if let Err(e) = webbrowser::open(&auth_url) {
        eprintln!("{} {}", "⚠️  Could not open browser automatically:".yellow(), e);
        println!("{}", "Please open this URL manually:".bright_white().bold());
        println!("{}", auth_url.bright_blue().underline());
    }
    println!();

    let timeout = tokio::time::Duration::from_secs(120);
    let start = tokio::time::Instant::now();

    loop {
        tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;

        let token = token_store
            .lock()
            .map_err(|_| anyhow::anyhow!("token store poisoned"))?
            .clone();
        if let Some(token) = token {
            server_handle.abort();
            return Ok(token);
        }

        if start.elapsed() > timeout {
            server_handle.abort();
            anyhow::bail!("Authentication timeout (2 minutes)");
        }
    }
}

const CALLBACK_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Signing in</title></head>
<body style="font-family: sans-serif; text-align: center; margin-top: 20vh;">
    <h1 id="status">Signing in...</h1>
    <p>You can close this window once the terminal says you are in.</p>
    <script>
        // Supabase puts the token in the fragment, which never reaches the server.
        const params = new URLSearchParams(window.location.hash.substring(1));
        const token = params.get('access_token');
        if (token) {
            fetch('/callback?access_token=' + encodeURIComponent(token))
                .then(() => setTimeout(() => window.close(), 1000));
        } else {
            document.getElementById('status').textContent = 'No token found, please try again.';
        }
    </script>
</body>
</html>"#;

async fn callback_handler(
    Query(params): Query<CallbackParams>,
    token_store: Arc<Mutex<Option<String>>>,
) -> Html<String> {
    if let Some(error) = params.error {
        return Html(format!(
            "<h1>❌ Authentication failed</h1><p>{}</p><p>Close this window and try again.</p>",
            error
        ));
    }
    if let Some(token) = params.access_token {
        if let Ok(mut store) = token_store.lock() {
            *store = Some(token);
        }
        return Html("<h1>✅ Signed in</h1>".to_string());
    }
    Html(CALLBACK_PAGE.to_string())
}

// ===== Browsing =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Screen {
    Feed,
    Mine,
    Post(PostId),
    Thread(CommentId),
}

/// A numbered line on screen that commands can refer to.
enum Row {
    Post(Post),
    Comment(Comment),
}

impl Screen {
    fn list_key(self) -> ViewKey {
        match self {
            Screen::Feed => ViewKey::NearbyFeed,
            Screen::Mine => ViewKey::MyPosts,
            Screen::Post(id) => ViewKey::Comments(id),
            Screen::Thread(id) => ViewKey::Replies(id),
        }
    }

    fn help(self) -> &'static str {
        match self {
            Screen::Feed | Screen::Mine => {
                "[o N]pen  [u N]p  [d N]own  [n]ew post  [me]  [m]ore  [r]efresh  [b]ack  [q]uit"
            }
            Screen::Post(_) => {
                "[u/d] post  [u/d N] comment  [c]omment  [c N] reply  [o N] thread  [x N] delete  [block N]  [m]ore  [b]ack  [q]uit"
            }
            Screen::Thread(_) => {
                "[u/d] comment  [u/d N] reply  [c] reply  [x N] delete  [block N]  [m]ore  [b]ack  [q]uit"
            }
        }
    }
}

fn feed_query(config: &ClientConfig, cursor: Option<i64>) -> FeedQuery {
    FeedQuery {
        lat: config.lat,
        lon: config.lon,
        distance: config.distance,
        cursor,
        limit: None,
        sort: None,
    }
}

fn page_query(cursor: Option<i64>) -> ListQuery {
    ListQuery {
        cursor,
        ..ListQuery::default()
    }
}

async fn load(
    coordinator: &CacheCoordinator,
    screen: Screen,
    config: &ClientConfig,
    cursor: Option<i64>,
) -> Result<(), ApiError> {
    match screen {
        Screen::Feed => {
            coordinator.load_feed(feed_query(config, cursor)).await?;
        }
        Screen::Mine => {
            coordinator.load_my_posts(page_query(cursor)).await?;
        }
        Screen::Post(id) => {
            if cursor.is_none() {
                coordinator.load_post(id).await?;
            }
            coordinator.load_comments(id, page_query(cursor)).await?;
        }
        Screen::Thread(id) => {
            if cursor.is_none() {
                coordinator.load_comment(id).await?;
            }
            coordinator.load_replies(id, page_query(cursor)).await?;
        }
    }
    Ok(())
}

async fn browse(
    coordinator: &CacheCoordinator,
    mut notices: UnboundedReceiver<Notice>,
    config: &ClientConfig,
) -> anyhow::Result<()> {
    let mut screen = Screen::Feed;
    let mut history: Vec<Screen> = Vec::new();
    report(load(coordinator, screen, config, None).await);

    loop {
        let rows = render(coordinator, screen);
        while let Ok(notice) = notices.try_recv() {
            println!("{} {}", "⚠️ ".yellow(), notice.message.yellow());
        }

        println!("{}", screen.help().bright_black());
        let input = prompt("> ")?;
        let mut words = input.split_whitespace();
        let command = words.next().unwrap_or("").to_lowercase();
        let index = words.next().and_then(|n| n.parse::<usize>().ok());
        let row = index.and_then(|n| n.checked_sub(1)).and_then(|n| rows.get(n));

        match (command.as_str(), row) {
            ("q" | "quit", _) => {
                println!();
                println!("{}", "See you around! 👋".bright_cyan().bold());
                return Ok(());
            }
            ("b" | "back", _) => {
                screen = history.pop().unwrap_or(Screen::Feed);
                report(load(coordinator, screen, config, None).await);
            }
            ("r" | "refresh", _) => report(load(coordinator, screen, config, None).await),
            ("m" | "more", _) => {
                match coordinator
                    .view(screen.list_key())
                    .and_then(|view| view.next_cursor())
                {
                    Some(cursor) => report(load(coordinator, screen, config, Some(cursor)).await),
                    None => println!("{}", "Nothing more to load.".bright_black()),
                }
            }
            ("me", _) => {
                history.push(screen);
                screen = Screen::Mine;
                report(load(coordinator, screen, config, None).await);
            }
            ("o" | "open", Some(row)) => {
                history.push(screen);
                screen = match row {
                    Row::Post(post) => Screen::Post(post.id),
                    Row::Comment(comment) => Screen::Thread(comment.id),
                };
                report(load(coordinator, screen, config, None).await);
            }
            ("u" | "up", row) => vote(coordinator, screen, row, VoteValue::Up).await,
            ("d" | "down", row) => vote(coordinator, screen, row, VoteValue::Down).await,
            ("n" | "new", _) if matches!(screen, Screen::Feed | Screen::Mine) => {
                let content = prompt("What's happening? ")?;
                let post = NewPost {
                    content,
                    lat: config.lat,
                    lon: config.lon,
                };
                match coordinator.api().create_post(&post).await {
                    Ok(_) => {
                        println!("{}", "✓ Posted".green());
                        report(load(coordinator, screen, config, None).await);
                    }
                    Err(e) => println!("{} {}", "❌".red(), e),
                }
            }
            ("c" | "comment", row) => {
                let Some((post, parent)) = reply_target(coordinator, screen, row) else {
                    println!("{}", "Open a post first.".red());
                    continue;
                };
                let content = prompt("Your comment: ")?;
                let comment = NewComment {
                    content,
                    parent_comment_id: parent,
                };
                if coordinator.create_comment(post, comment).await.is_ok() {
                    println!("{}", "✓ Commented".green());
                    report(load(coordinator, screen, config, None).await);
                }
            }
            ("x" | "delete", Some(Row::Comment(comment))) => {
                if coordinator.delete_comment(comment).await.is_ok() {
                    println!("{}", "✓ Deleted".green());
                }
            }
            ("block", Some(row)) => {
                let author = match row {
                    Row::Post(post) => &post.author_id,
                    Row::Comment(comment) => &comment.author_id,
                };
                match coordinator.api().block_user(author).await {
                    Ok(()) => {
                        println!("{}", "✓ Blocked".green());
                        report(load(coordinator, screen, config, None).await);
                    }
                    Err(e) => println!("{} {}", "❌".red(), e),
                }
            }
            _ => println!("{}", "Invalid choice. Please try again.".red()),
        }
    }
}

/// Vote on a numbered row, or on the post or comment the screen is about.
async fn vote(coordinator: &CacheCoordinator, screen: Screen, row: Option<&Row>, value: VoteValue) {
    let result = match (row, screen) {
        (Some(Row::Post(post)), _) => coordinator.vote_post(post.id, value).await.map(|r| r.vote),
        (Some(Row::Comment(comment)), _) => {
            coordinator.vote_comment(comment, value).await.map(|r| r.vote)
        }
        (None, Screen::Post(id)) => coordinator.vote_post(id, value).await.map(|r| r.vote),
        (None, Screen::Thread(id)) => match coordinator.view(ViewKey::CommentDetail(id)) {
            Some(View::Comment(comment)) => {
                coordinator.vote_comment(&comment, value).await.map(|r| r.vote)
            }
            _ => return,
        },
        (None, _) => {
            println!("{}", "Which one? Add its number.".red());
            return;
        }
    };
    if let Ok(vote) = result {
        println!("{}", vote_label(vote.value));
    }
}

fn vote_label(stored: VoteValue) -> ColoredString {
    match stored {
        VoteValue::Up => "✓ Voted up".green(),
        VoteValue::Down => "✓ Voted down".red(),
        VoteValue::Neutral => "✓ Vote withdrawn".yellow(),
    }
}

/// Where a new comment goes: the post itself, or the top-level comment being replied to.
fn reply_target(
    coordinator: &CacheCoordinator,
    screen: Screen,
    row: Option<&Row>,
) -> Option<(PostId, Option<CommentId>)> {
    match (screen, row) {
        (_, Some(Row::Comment(comment))) => Some((
            comment.post_id,
            Some(comment.parent_comment_id.unwrap_or(comment.id)),
        )),
        (Screen::Post(id), _) => Some((id, None)),
        (Screen::Thread(id), _) => match coordinator.view(ViewKey::CommentDetail(id))? {
            View::Comment(comment) => Some((comment.post_id, Some(id))),
            _ => None,
        },
        _ => None,
    }
}

fn report(result: Result<(), ApiError>) {
    if let Err(e) = result {
        println!("{} {}", "❌".red(), e);
    }
}

fn prompt(label: &str) -> io::Result<String> {
    print!("{}", label.bright_green().bold());
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

// ===== Rendering =====

fn render(coordinator: &CacheCoordinator, screen: Screen) -> Vec<Row> {
    println!("{}", "━".repeat(60).bright_black());
    let mut rows = Vec::new();

    match screen {
        Screen::Feed | Screen::Mine => {
            let title = if screen == Screen::Feed { "NEARBY" } else { "MY POSTS" };
            println!("{}", title.bright_yellow().bold());
            if let Some(view) = coordinator.view(screen.list_key()) {
                for post in view.posts() {
                    rows.push(Row::Post(post.clone()));
                    print_post(rows.len(), post);
                }
            }
        }
        Screen::Post(id) => {
            if let Some(View::Post(post)) = coordinator.view(ViewKey::PostDetail(id)) {
                println!("{}", post.content.bright_white().bold());
                println!(
                    "{} {}  {}",
                    marker(post.my_vote),
                    post.score.to_string().bright_cyan(),
                    ago(post.created_at).bright_black()
                );
            }
            println!();
            if let Some(view) = coordinator.view(screen.list_key()) {
                for comment in view.comments() {
                    rows.push(Row::Comment(comment.clone()));
                    print_comment(rows.len(), comment, 0);
                    for reply in &comment.replies {
                        rows.push(Row::Comment(reply.clone()));
                        print_comment(rows.len(), reply, 1);
                    }
                    let hidden = comment.replies_count - comment.replies.len() as i64;
                    if hidden > 0 {
                        println!("      {}", format!("… {} more replies", hidden).bright_black());
                    }
                }
            }
        }
        Screen::Thread(id) => {
            if let Some(View::Comment(comment)) = coordinator.view(ViewKey::CommentDetail(id)) {
                print_comment(0, &comment, 0);
            }
            println!();
            if let Some(view) = coordinator.view(screen.list_key()) {
                for reply in view.comments() {
                    rows.push(Row::Comment(reply.clone()));
                    print_comment(rows.len(), reply, 1);
                }
            }
        }
    }

    if rows.is_empty() {
        println!("{}", "Nothing here yet.".bright_black());
    }
    println!();
    rows
}

fn marker(my_vote: Option<VoteValue>) -> ColoredString {
    match my_vote {
        Some(VoteValue::Up) => "▲".green(),
        Some(VoteValue::Down) => "▼".red(),
        _ => "·".bright_black(),
    }
}

fn print_post(n: usize, post: &Post) {
    println!(
        "{} {} {:>4}  {}  {}",
        format!("[{}]", n).bright_cyan(),
        marker(post.my_vote),
        post.score,
        post.content.bright_white(),
        format!("💬 {} · {}", post.comments_count, ago(post.created_at)).bright_black()
    );
}

fn print_comment(n: usize, comment: &Comment, depth: usize) {
    let label = if n == 0 {
        String::new()
    } else {
        format!("[{}]", n)
    };
    println!(
        "{}{} {} {:>4}  {}  {}",
        "    ".repeat(depth),
        label.bright_cyan(),
        marker(comment.my_vote),
        comment.score,
        comment.content,
        format!("{} · {}", comment.author_id, ago(comment.created_at)).bright_black()
    );
}

fn ago(at: DateTime<Utc>) -> String {
    let elapsed = Utc::now().signed_duration_since(at);
    if elapsed.num_days() > 0 {
        format!("{}d", elapsed.num_days())
    } else if elapsed.num_hours() > 0 {
        format!("{}h", elapsed.num_hours())
    } else {
        format!("{}m", elapsed.num_minutes().max(0))
    }
}
