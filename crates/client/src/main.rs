//! Eventsub CLI - main entry point
//!
//! Thin command-line front end over [`ClientContext`].

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use eventsub_client::{ClientConfig, ClientContext};
use eventsub_shared::{Event, EventInput, EventWithSubscription};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "eventsub")]
#[command(about = "Manage event subscriptions")]
#[command(version)]
struct Cli {
    /// API base URL
    #[arg(long, env = "EVENTSUB_API_URL")]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in as an existing user
    Login { username: String },
    /// Register a new user (or log in if it exists)
    Register { username: String },
    /// Forget the stored credential
    Logout,
    /// Show the signed-in user
    Whoami,
    /// List events and whether you are subscribed
    Events {
        /// Only events from this system
        #[arg(long)]
        system: Option<String>,
    },
    /// Subscribe to an event
    Subscribe { event_id: i64 },
    /// Unsubscribe from an event
    Unsubscribe { event_id: i64 },
    /// Check subscription status for an event
    Status { event_id: i64 },
    /// Manage events (admin)
    Event {
        #[command(subcommand)]
        command: EventCommand,
    },
}

#[derive(Subcommand)]
enum EventCommand {
    Show { id: i64 },
    Create(EventFields),
    Update {
        id: i64,
        #[command(flatten)]
        fields: EventFields,
    },
    Delete { id: i64 },
}

#[derive(Args)]
struct EventFields {
    #[arg(long)]
    system: String,
    #[arg(long)]
    name: String,
    #[arg(long)]
    topic: String,
    #[arg(long, default_value = "")]
    description: String,
}

impl From<EventFields> for EventInput {
    fn from(f: EventFields) -> Self {
        EventInput {
            system_name: f.system,
            event_name: f.name,
            kafka_topic: f.topic,
            description: f.description,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("eventsub_client=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = ClientConfig::from_env();
    if let Some(url) = cli.api_url {
        config = config.with_base_url(url);
    }
    let ctx = ClientContext::from_config(config).context("failed to initialise client")?;
    let mut errors = ctx.errors().subscribe();

    let outcome = run(&ctx, cli.command).await;

    while let Some(notice) = errors.try_recv() {
        eprintln!("error: {}", notice.message);
    }
    outcome
}

async fn run(ctx: &ClientContext, command: Commands) -> Result<()> {
    match command {
        Commands::Login { username } => {
            let user = ctx.login(&username).await?;
            println!("logged in as {} ({:?})", user.username, user.role);
        }
        Commands::Register { username } => {
            let user = ctx.register(&username).await?;
            println!("registered {} ({:?})", user.username, user.role);
        }
        Commands::Logout => {
            ctx.logout();
            println!("logged out");
        }
        Commands::Whoami => {
            require_login(ctx)?;
            let user = ctx.current_user().await?;
            println!("{} (id {}, {:?})", user.username, user.id, user.role);
        }
        Commands::Events { system } => {
            require_login(ctx)?;
            let rows = ctx.subscriptions().load().await?;
            let rows: Vec<_> = rows
                .into_iter()
                .filter(|r| system.as_deref().map_or(true, |s| r.event.system_name == s))
                .collect();
            print_events(&rows);
        }
        Commands::Subscribe { event_id } => {
            require_login(ctx)?;
            ctx.subscriptions().load().await?;
            let sub = ctx.subscriptions().subscribe(event_id).settled().await?;
            println!("subscribed to {} ({})", sub.event_name, sub.system_name);
        }
        Commands::Unsubscribe { event_id } => {
            require_login(ctx)?;
            ctx.subscriptions().load().await?;
            ctx.subscriptions().unsubscribe(event_id).settled().await?;
            println!("unsubscribed from event {event_id}");
        }
        Commands::Status { event_id } => {
            require_login(ctx)?;
            let status = ctx.subscriptions().subscription_status(event_id).await?;
            let state = if status.subscribed { "subscribed" } else { "not subscribed" };
            println!("event {}: {state}", status.event_id);
        }
        Commands::Event { command } => {
            require_login(ctx)?;
            run_event_command(ctx, command).await?;
        }
    }
    Ok(())
}

async fn run_event_command(ctx: &ClientContext, command: EventCommand) -> Result<()> {
    match command {
        EventCommand::Show { id } => print_event(&ctx.api().get_event(id).await?),
        EventCommand::Create(fields) => {
            let event = ctx.create_event(&fields.into()).await?;
            println!("created event {}", event.id);
        }
        EventCommand::Update { id, fields } => {
            let event = ctx.update_event(id, &fields.into()).await?;
            println!("updated event {}", event.id);
        }
        EventCommand::Delete { id } => {
            ctx.delete_event(id).await?;
            println!("deleted event {id}");
        }
    }
    Ok(())
}

fn require_login(ctx: &ClientContext) -> Result<()> {
    if !ctx.is_authenticated() {
        bail!("not logged in; run `eventsub login <username>` first");
    }
    Ok(())
}

fn print_events(rows: &[EventWithSubscription]) {
    if rows.is_empty() {
        println!("no events");
        return;
    }
    for row in rows {
        let mark = if row.subscribed { "[x]" } else { "[ ]" };
        println!(
            "{mark} {:>5}  {:<20} {:<30} {}",
            row.event.id, row.event.system_name, row.event.event_name, row.event.kafka_topic
        );
    }
}

fn print_event(event: &Event) {
    println!("id:          {}", event.id);
    println!("system:      {}", event.system_name);
    println!("name:        {}", event.event_name);
    println!("topic:       {}", event.kafka_topic);
    println!("description: {}", event.description);
    println!("created:     {}", event.created_at);
    println!("updated:     {}", event.updated_at);
}
