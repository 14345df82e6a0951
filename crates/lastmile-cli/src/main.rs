//! Dispatcher command line for the last-mile route planner.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lastmile_core::models::Shipment;
use lastmile_planner::{
    plan_daily, GeocodeCache, NominatimClient, OriginStore, PlanRequest, PlannerConfig,
    RouteStore, SqliteKv,
};

/// Plan and inspect daily delivery routes
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate daily routes from a shipment export (JSON array)
    Plan {
        /// Planning date (YYYY-MM-DD); defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Path to the shipment export
        #[arg(long)]
        shipments: String,

        /// Driver id applied where a route has none
        #[arg(long)]
        driver: Option<String>,
    },

    /// List routes planned for a date
    Routes {
        /// Date (YYYY-MM-DD); defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Show the warehouse origin, or move it when coordinates are given
    Origin {
        #[arg(long, requires = "lon")]
        lat: Option<f64>,

        #[arg(long, requires = "lat")]
        lon: Option<f64>,

        #[arg(long, default_value = "Depozit")]
        label: String,
    },

    /// Resolve one address through the geocode cache
    Geocode { query: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lastmile=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = PlannerConfig::from_env();
    let kv = Arc::new(SqliteKv::open(&config.db_path).await?);

    match cli.command {
        Command::Plan {
            date,
            shipments,
            driver,
        } => {
            let date = date.unwrap_or_else(|| Local::now().date_naive());
            let raw = tokio::fs::read_to_string(&shipments).await?;
            let shipments: Vec<Shipment> = serde_json::from_str(&raw)?;

            let store = RouteStore::new(Arc::clone(&kv));
            let geocoder = NominatimClient::new(&config.geocoder_url, config.geocode_timeout)?;
            let cache = GeocodeCache::new(Arc::clone(&kv), geocoder, &config);
            let origin = OriginStore::new(Arc::clone(&kv)).get().await.position();

            let summary = plan_daily(
                &store,
                &cache,
                origin,
                &config,
                PlanRequest {
                    date,
                    shipments,
                    default_driver_id: driver,
                },
            )
            .await;

            println!("Planned {}", summary.date);
            println!("  created routes:       {}", summary.created_routes);
            println!("  allocated:            {}", summary.allocated_awbs);
            println!("  deliverable:          {}", summary.deliverable_total);
            println!("  deliverable in region:{}", summary.deliverable_in_region);
            println!("  already assigned:     {}", summary.already_assigned);
            println!("  missing region:       {}", summary.missing_region);
            println!("  outside region:       {}", summary.outside_region);
            for route in &summary.routes {
                println!("  {} ({} stops): {}", route.name, route.awbs.len(), route.awbs.join(", "));
            }
        }
        Command::Routes { date } => {
            let date = date.unwrap_or_else(|| Local::now().date_naive());
            let store = RouteStore::new(kv);
            let routes = store.list_for_date(date).await;
            if routes.is_empty() {
                println!("No routes planned for {}", date);
            }
            for route in routes {
                let driver = route.driver_name.as_deref().unwrap_or("-");
                println!(
                    "{}  {}  driver: {}  stops: {}",
                    route.id,
                    route.name,
                    driver,
                    route.awbs.len()
                );
            }
        }
        Command::Origin { lat, lon, label } => {
            let store = OriginStore::new(kv);
            let origin = match (lat, lon) {
                (Some(lat), Some(lon)) => store.set(lat, lon, &label).await,
                _ => store.get().await,
            };
            println!("{} ({}, {})", origin.label, origin.lat, origin.lon);
        }
        Command::Geocode { query } => {
            let geocoder = NominatimClient::new(&config.geocoder_url, config.geocode_timeout)?;
            let cache = GeocodeCache::new(Arc::clone(&kv), geocoder, &config);
            match cache.geocode(&query).await {
                Some(result) => println!(
                    "{:.6}, {:.6}  {}",
                    result.lat,
                    result.lon,
                    result.display_name.unwrap_or_default()
                ),
                None => println!("No result for {:?}", query),
            }
            cache.flush_now().await;
        }
    }

    Ok(())
}
