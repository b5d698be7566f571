//! tierorm command line
//!
//! ```text
//! tierorm validate --config pools.yaml   check a pool configuration
//! tierorm demo [--config pools.yaml]     run the cache-consistency demo
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tierorm::{
    CachedQuery, ColumnKind, Entity, EntitySchema, EntityState, MemoryAdapterFactory, OrmConfig,
    Pager, Registry, Value,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Cache-consistent entity mapping runtime
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate a pool configuration
    Validate {
        /// Pool configuration file (YAML)
        #[arg(long, env = "TIERORM_CONFIG")]
        config: PathBuf,
    },
    /// Run the Age 10/18 invalidation scenario against in-memory pools
    Demo {
        /// Pool configuration file (YAML), in-memory defaults when absent
        #[arg(long, env = "TIERORM_CONFIG")]
        config: Option<PathBuf>,
    },
}

const DEMO_CONFIG: &str = r#"
storage:
  default:
    uri: memory://default
local_cache:
  default:
    capacity: 10000
shared_cache:
  default:
    address: memory://default
"#;

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    match args.command {
        Command::Validate { config } => validate(&config),
        Command::Demo { config } => demo(config.as_deref()).await,
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Commands
// =============================================================================

fn validate(path: &std::path::Path) -> anyhow::Result<()> {
    let config = OrmConfig::from_file(path)
        .with_context(|| format!("invalid configuration {}", path.display()))?;

    println!("Configuration {} is valid", path.display());
    for (name, pool) in &config.storage {
        println!(
            "  storage       {:<12} {} (step {})",
            name, pool.uri, pool.auto_increment_step
        );
    }
    for (name, pool) in &config.local_cache {
        println!("  local cache   {:<12} {} entries", name, pool.capacity);
    }
    for (name, pool) in &config.shared_cache {
        println!(
            "  shared cache  {:<12} {}{}",
            name,
            pool.address,
            pool.namespace
                .as_deref()
                .map(|ns| format!(" (namespace {})", ns))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn demo(config_path: Option<&std::path::Path>) -> anyhow::Result<()> {
    let config = match config_path {
        Some(path) => OrmConfig::from_file(path)
            .with_context(|| format!("invalid configuration {}", path.display()))?,
        None => OrmConfig::from_yaml_str(DEMO_CONFIG)?,
    };

    let registry = Registry::builder()
        .apply_config(&config, &MemoryAdapterFactory)?
        .entity(person_schema()?)
        .validate()?;
    let mut session = registry.session();

    let mut young = Person::new("Ann", 10);
    let mut adult = Person::new("Bob", 18);
    let mut senior = Person::new("Cid", 30);
    session
        .flush(&mut [&mut young, &mut adult, &mut senior])
        .await?;
    info!(ids = ?[young.id, adult.id, senior.id], "Inserted people");

    let page = Pager::first(100);
    for age in [10, 18, 30] {
        let total = session
            .cached_search_count::<Person>("IndexAge", &[Value::Int(age)])
            .await?;
        println!("Age {:>2}: {} people", age, total);
    }

    registry.metrics().reset();
    young.age = 18;
    session.flush_one(&mut young).await?;
    println!("Moved {} from age 10 to 18", young.name);

    for age in [10, 18, 30] {
        let (people, total) = session
            .cached_search::<Person>("IndexAge", &page, &[Value::Int(age)], &[])
            .await?;
        let names: Vec<&str> = people.iter().map(|p| p.name.as_str()).collect();
        println!("Age {:>2}: {} people {:?}", age, total, names);
    }

    // The Age 30 bucket was untouched by the update and is served from cache
    println!();
    println!("{}", registry.metrics().snapshot());
    Ok(())
}

// =============================================================================
// Demo Entity
// =============================================================================

#[derive(Debug, Default)]
struct Person {
    id: u64,
    name: String,
    age: i64,
    state: EntityState,
}

impl Person {
    fn new(name: &str, age: i64) -> Self {
        Self {
            name: name.to_string(),
            age,
            ..Default::default()
        }
    }
}

impl Entity for Person {
    fn entity_name(&self) -> &'static str {
        "Person"
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn state(&self) -> &EntityState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut EntityState {
        &mut self.state
    }

    fn column_values(&self) -> Vec<Value> {
        vec![self.name.clone().into(), self.age.into()]
    }

    fn apply_column_values(&mut self, values: &[Value]) -> tierorm::Result<()> {
        self.name = values[0].get("Name")?;
        self.age = values[1].get("Age")?;
        Ok(())
    }
}

fn person_schema() -> tierorm::Result<EntitySchema> {
    EntitySchema::builder("Person")
        .column("Name", ColumnKind::Str)
        .column("Age", ColumnKind::Int)
        .local_cache("default")
        .shared_cache("default")
        .cached_query(CachedQuery::new("IndexAge").filter("Age"))
        .build()
}
