use async_trait::async_trait;
use colored::Colorize as _;
use portunnel_models::RequestLogRecord;
use portunnel_proxy::LogDestination;

/// Prints one line per relayed request or frame to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleLogDestination;

#[async_trait]
impl LogDestination for ConsoleLogDestination {
    async fn log(&self, record: RequestLogRecord) {
        println!("{}", render(&record));
    }
}

fn render(record: &RequestLogRecord) -> String {
    let time = record.time.format("%Y-%m-%d %H:%M:%S%.3f").to_string();

    let mut line = format!("{} ", time.dimmed());

    if record.is_web_socket {
        line.push_str(&format!("{} ", "WebSocket".magenta().bold()));
    } else {
        let method = record.method.as_deref().unwrap_or("?");
        line.push_str(&format!("{} ", method.cyan().bold()));
    }

    line.push_str(&record.path_and_query);

    if record.is_web_socket {
        if record.is_final_frame {
            line.push_str(&format!(" {}", "(end of message)".dimmed()));
        }
    } else if let Some(headers) = record.headers.as_ref().filter(|headers| !headers.is_empty()) {
        for (name, value) in headers {
            line.push_str(&format!("\n    {}: {value}", name.yellow()));
        }
    }

    line
}
