use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};

use community_calendar_lib::{
    config::ConfigStore,
    dates::Today,
    db::{DuplicateField, Store},
    import::{self, Flash, HttpFetcher},
    search::{self, SearchEngineKind, SearchOptions, SearchOrder},
    source_parser::ParseOptions,
};

#[derive(Parser)]
#[command(name = "community-calendar")]
#[command(about = "Track community events, venues and the feeds they come from")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// SQLite database to use instead of the configured one
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        /// Address to listen on, e.g. 127.0.0.1:3000
        #[arg(long)]
        bind: Option<String>,
    },
    /// Import an iCalendar or hCalendar source (http(s):// or file:// url)
    Import {
        url: String,
        /// Skip events that are already over
        #[arg(long)]
        skip_old: bool,
    },
    /// Search events by keyword
    Search {
        query: String,
        #[arg(long, value_parser = parse_order)]
        order: Option<SearchOrder>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        skip_old: bool,
        /// Engine to use for this search (sql or indexed)
        #[arg(long)]
        engine: Option<SearchEngineKind>,
    },
    /// List events sharing the given fields
    Duplicates {
        #[arg(long, default_value = "title")]
        by: String,
    },
}

fn parse_order(raw: &str) -> Result<SearchOrder, String> {
    match raw {
        "score" => Ok(SearchOrder::Score),
        "date" => Ok(SearchOrder::Date),
        "name" => Ok(SearchOrder::Name),
        "venue" => Ok(SearchOrder::Venue),
        other => Err(format!("unknown order: {other}")),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    community_calendar_lib::init_tracing(cli.verbose)?;

    let config = ConfigStore::load();
    let mut settings = config.read();
    let mut overridden = false;
    if let Some(path) = cli.database {
        settings.database_path = Some(path);
        overridden = true;
    }
    if let Commands::Serve { bind: Some(ref bind) } = cli.command {
        settings.bind_address = bind.clone();
        overridden = true;
    }
    // Command line overrides apply to this run only and are never written back.
    let config = if overridden {
        ConfigStore::in_memory(settings)
    } else {
        config
    };
    dispatch(cli.command, config)
}

fn dispatch(command: Commands, config: ConfigStore) -> Result<()> {
    let settings = config.read();
    match command {
        Commands::Serve { .. } => community_calendar_lib::run(config),
        Commands::Import { url, skip_old } => {
            let store = Store::open(&settings.database_path())?;
            let tz = settings.tz();
            let options = ParseOptions {
                skip_old,
                today: Today::at(Utc::now(), tz).start,
                tz,
                base_url: None,
            };
            let result = import::import_source(&store, &HttpFetcher, &url, &options);
            let flash = Flash::for_result(&result);
            println!("{flash}");
            result.map(|_| ()).map_err(Into::into)
        }
        Commands::Search {
            query,
            order,
            limit,
            skip_old,
            engine,
        } => {
            let store = Store::open(&settings.database_path())?;
            let now = Utc::now();
            let options = SearchOptions {
                skip_old,
                order,
                limit,
                now: Some(now),
                tz: Some(settings.tz()),
            };
            let engine = search::engine_for(engine.unwrap_or(settings.search_engine));
            let hits = engine.search(&store, &query, &options)?;
            let grouped = search::group_by_currentness(hits, Today::at(now, settings.tz()).start);
            for (label, hits) in [("Current", grouped.current), ("Past", grouped.past)] {
                println!("{label} events ({}):", hits.len());
                for hit in hits {
                    let score = hit.score.map(|s| format!(" [{s:.2}]")).unwrap_or_default();
                    println!(
                        "  {} #{} {}{score}",
                        hit.event.start_time.format("%Y-%m-%d %H:%M"),
                        hit.event.id,
                        hit.event.title
                    );
                }
            }
            Ok(())
        }
        Commands::Duplicates { by } => {
            let store = Store::open(&settings.database_path())?;
            let fields = DuplicateField::parse_list(&by)?;
            let pairs = store.find_duplicate_pairs(&fields)?;
            if pairs.is_empty() {
                println!("No duplicates by {by}");
            }
            for pair in pairs {
                println!(
                    "#{} {} <-> #{} {}",
                    pair.original.id, pair.original.title, pair.duplicate.id, pair.duplicate.title
                );
            }
            Ok(())
        }
    }
}
