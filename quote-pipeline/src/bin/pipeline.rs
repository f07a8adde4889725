// Run the full detect -> tally -> quote pipeline on one floor-plan image
use std::fs;

use quote_generator::QuoteGenerator;
use quote_pipeline::{NoticeLevel, QuoteOrchestrator};
use symbol_detector::{ImageReference, SymbolDetector};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("⚡ Electrical Symbol Quotation Pipeline");
    println!("========================================\n");

    if std::env::var("ROBOFLOW_API_KEY").is_err() {
        eprintln!("❌ Error: ROBOFLOW_API_KEY environment variable not set");
        eprintln!("\nPlease set your detection workflow key:");
        eprintln!("  export ROBOFLOW_API_KEY=...");
        return Ok(());
    }
    if std::env::var("GEMINI_API_KEY").is_err() {
        eprintln!("❌ Error: GEMINI_API_KEY environment variable not set");
        eprintln!("\nPlease set your quote model key:");
        eprintln!("  export GEMINI_API_KEY=...");
        return Ok(());
    }

    let args: Vec<String> = std::env::args().collect();
    let Some(image_arg) = args.get(1) else {
        eprintln!("Usage: cargo run --bin pipeline <IMAGE_PATH_OR_URL>");
        eprintln!("\nExample:");
        eprintln!("  cargo run --bin pipeline floorplans/unit_2b.png");
        return Ok(());
    };

    let image = if image_arg.starts_with("http://") || image_arg.starts_with("https://") {
        println!("🌐 Using hosted image: {}", image_arg);
        ImageReference::from_url(image_arg.clone())
    } else {
        println!("📂 Loading image: {}", image_arg);
        let bytes = match fs::read(image_arg) {
            Ok(bytes) => bytes,
            Err(e) => {
                eprintln!("❌ Failed to read image: {}", e);
                return Ok(());
            }
        };
        println!("✅ Loaded {} bytes", bytes.len());
        ImageReference::from_image_bytes(&bytes)?
    };

    let detector = SymbolDetector::from_env()?;
    let quoter = QuoteGenerator::from_env()?;
    let mut orchestrator = QuoteOrchestrator::new(detector, quoter);
    orchestrator.select_image(image);

    println!("\n🤖 Running detection and quotation...");
    println!("(Two hosted AI calls; this may take a while)\n");

    let outcome = orchestrator.run().await;

    for notice in orchestrator.drain_notices() {
        let marker = match notice.level {
            NoticeLevel::Info => "ℹ️ ",
            NoticeLevel::Success => "✅",
            NoticeLevel::Error => "❌",
        };
        println!("{} {}", marker, notice.message);
    }

    if let Err(e) = outcome {
        eprintln!("\nPipeline did not complete: {}", e);
        eprintln!("\nPossible issues:");
        eprintln!("  - Invalid ROBOFLOW_API_KEY or GEMINI_API_KEY");
        eprintln!("  - Network connection problem");
        eprintln!("  - API rate limit exceeded");
        if orchestrator.tally().is_none() {
            return Ok(());
        }
        println!("\nDetection finished before the failure; partial results follow.");
    }

    if let Some(tally) = orchestrator.tally() {
        println!("\n📊 Detected Components");
        println!("{}", "=".repeat(40));
        if tally.is_empty() {
            println!("(no electrical symbols detected)");
        }
        for (class, count) in tally {
            println!("  {:<28} x{}", class.replace('_', " "), count);
        }
    }

    if let Some(quote) = orchestrator.quote() {
        if let Some(spec) = quote.electrical_specifications.as_ref() {
            println!("\n💰 Quotation");
            println!("{}", "=".repeat(70));
            for component in &spec.components {
                println!(
                    "  {} ({})",
                    component.name.as_deref().unwrap_or("(unnamed)"),
                    component.class_name.as_deref().unwrap_or("?")
                );
                println!(
                    "      unit: {}  qty: {}  total: {}",
                    component
                        .product_price
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    component
                        .quantity
                        .map(|q| q.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    component
                        .total
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                );
                if let Some(url) = component.product_url.as_deref() {
                    println!("      product: {}", url);
                }
            }
            println!("{}", "-".repeat(70));
            println!(
                "  TOTAL QUOTATION: {}",
                spec.total_quote
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
        }
    }

    if let Some(annotated) = orchestrator.detection().and_then(|d| d.annotated_image_png()) {
        let output_path = "annotated_detection.png";
        fs::write(output_path, &annotated)?;
        println!("\n💾 Saved annotated detection image to: {}", output_path);
    }

    let report = serde_json::json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "state": orchestrator.state(),
        "tally": orchestrator.tally(),
        "quote": orchestrator.quote(),
    });
    let report_path = "quote_report.json";
    fs::write(report_path, serde_json::to_string_pretty(&report)?)?;
    println!("💾 Saved run report to: {}", report_path);

    Ok(())
}
