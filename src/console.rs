use crate::core::broadcaster::Observer;
use crate::core::events::TelemetryEvent;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;

/// Terminal observer: renders telemetry as a progress bar on stderr.
pub async fn run(mut rx: Observer) {
    let sty_spinner = ProgressStyle::with_template("{spinner:.green} {prefix} {wide_msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars("|/-\\ ");
    let sty_bar = ProgressStyle::with_template(
        "{prefix} {bar:40.cyan/blue} {bytes}/{total_bytes} ({msg}, eta {eta})",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar());

    let mut bar: Option<ProgressBar> = None;

    loop {
        let evt = match rx.recv().await {
            Ok(e) => e,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };

        match evt {
            TelemetryEvent::Progress(p) => {
                let pb = bar.get_or_insert_with(|| {
                    let pb = ProgressBar::new_spinner();
                    pb.set_style(sty_spinner.clone());
                    pb.enable_steady_tick(std::time::Duration::from_millis(120));
                    pb
                });
                pb.set_prefix(format!("[{}]", p.name.as_deref().unwrap_or("resolving")));
                match p.total_bytes {
                    Some(t) => {
                        if pb.length() != Some(t) {
                            pb.set_style(sty_bar.clone());
                            pb.set_length(t);
                        }
                        pb.set_position(p.bytes_transferred.min(t));
                        pb.set_message(format!("{}/s", fmt_bytes(p.rate_per_sec)));
                    }
                    None => pb.set_message(format!("{} | {}/s", fmt_bytes(p.bytes_transferred), fmt_bytes(p.rate_per_sec))),
                }
            }
            terminal => {
                let line = match &terminal {
                    TelemetryEvent::Done(d) => format!("[DONE] {}", d.message),
                    TelemetryEvent::Cancelled(c) => format!("[CANCELLED] {}", c.message),
                    TelemetryEvent::Error(e) => format!("[ERR] {}", e.message),
                    TelemetryEvent::Progress(_) => continue,
                };
                match bar.take() {
                    Some(pb) => pb.finish_with_message(line),
                    None => eprintln!("{}", line),
                }
            }
        }
    }
}

fn fmt_bytes(n: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    let f = n as f64;
    if f >= GB {
        format!("{:.2}GiB", f / GB)
    } else if f >= MB {
        format!("{:.2}MiB", f / MB)
    } else if f >= KB {
        format!("{:.2}KiB", f / KB)
    } else {
        format!("{}B", n)
    }
}
