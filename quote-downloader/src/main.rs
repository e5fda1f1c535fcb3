mod config;
mod fetch;

use anyhow::{Context, Result};
use quote_store::{
    ensure_namespace_with_retries, ingest, quote::format_timestamp_nanos, read_quotes_limited,
    IngestReport, QuoteStore, QuotesPage,
};
use reqwest::blocking::Client;
use tracing::{debug, info, info_span, trace, Level};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::AppConfig;
use crate::fetch::fetch_with_retries;

// Quotes reconstructed from the store and logged at debug after ingest.
const READ_BACK_SAMPLE: usize = 5;

// Function to initialize tracing
fn setup_logging() {
    let filter = EnvFilter::from_default_env()
        .add_directive("quote_downloader=info".parse().unwrap())
        .add_directive("quote_store=info".parse().unwrap());

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    setup_logging();
    let config = AppConfig::load()?;
    let symbol = config.request.symbol.clone();
    info!(
        symbol = %symbol,
        store = ?config.store.path,
        max_pages = config.request.max_pages,
        "Starting quote download"
    );

    let client = Client::builder()
        .timeout(config.request.timeout())
        .build()
        .context("building HTTP client")?;
    let credentials = config.credentials();

    let store = QuoteStore::open_with_retries(&config.store, &config.store_retry)
        .with_context(|| format!("opening store {:?}", config.store.path))?;
    ensure_namespace_with_retries(&store, &symbol, &config.store_retry)?;

    // --- Download and ingest, page by page ---
    let mut totals = IngestReport::default();
    let mut page_token: Option<String> = None;
    for page_number in 1..=config.request.max_pages {
        let page_span = info_span!("page", number = page_number).entered();
        let url = config.request.url(page_token.as_deref())?;
        let body = fetch_with_retries(&client, &url, &credentials, &config.fetch_retry)?;
        let page = QuotesPage::from_json(&body)
            .with_context(|| format!("decoding page {page_number} for {symbol}"))?;
        info!("Page {} returned {} quotes", page_number, page.quotes.len());
        for quote in &page.quotes {
            trace!(?quote, "Decoded quote");
        }

        let report = ingest(&store, &symbol, page.quotes, &config.ingest)
            .with_context(|| format!("ingesting page {page_number} for {symbol}"))?;
        totals.batches += report.batches;
        totals.written += report.written;
        totals.skipped += report.skipped;
        drop(page_span);

        page_token = page.next_page_token.filter(|token| !token.is_empty());
        if page_token.is_none() {
            break;
        }
    }
    info!(
        "Ingested {} quotes for {} in {} batches ({} skipped)",
        totals.written, symbol, totals.batches, totals.skipped
    );

    // --- Read-back report ---
    let stored = quote_store::count(&store, &symbol)?;
    let earliest = quote_store::first_timestamp(&store, &symbol)?;
    let latest = quote_store::last_timestamp(&store, &symbol)?;
    println!("QUOTES_STORED: {}", stored);
    if let (Some(earliest), Some(latest)) = (earliest, latest) {
        println!("QUOTES_EARLIEST: {}", format_timestamp_nanos(earliest));
        println!("QUOTES_LATEST: {}", format_timestamp_nanos(latest));

        if tracing::enabled!(Level::DEBUG) {
            for quote in read_quotes_limited(&store, &symbol, earliest.., READ_BACK_SAMPLE)? {
                debug!(?quote, "Stored quote");
            }
        }
    }
    if page_token.is_some() {
        info!("More pages are available; raise request.max_pages to continue");
    }

    store.close()?;
    Ok(())
}
