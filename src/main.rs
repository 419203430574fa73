// Terminal demo client: type to send, /mic to dictate, /quit to exit.

use parlance::{
    CaptureStatus, ConnectionState, Conversation, NoHistory, Notifier, RestSource, Role, Settings,
};
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

struct StderrNotifier;

impl Notifier for StderrNotifier {
    fn notify(&self, message: &str) {
        eprintln!("[notice] {}", message);
    }
}

fn main() {
    env_logger::init();

    let settings: Settings = parlance::settings::load();
    println!("[parlance] connecting to {}", settings.server_url);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("[parlance] failed to create runtime: {}", e);
            return;
        }
    };
    // The engine spawns its tasks onto this runtime's workers; the main
    // thread stays a plain blocking REPL.
    let _runtime_context = runtime.enter();

    let source: Arc<dyn parlance::ConversationSource> = if settings.api_url.is_empty() {
        Arc::new(NoHistory)
    } else {
        Arc::new(RestSource::new(
            settings.api_url.clone(),
            non_empty(&settings.user_id),
            non_empty(&settings.user_email),
        ))
    };

    let engine = Conversation::open(&settings, source, Arc::new(StderrNotifier));

    println!("[parlance] ready; /mic toggles dictation, /quit exits");
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        match line.trim() {
            "" => continue,
            "/quit" => break,
            "/mic" => {
                if engine.start_capture().is_ok() {
                    println!("[parlance] listening; a final transcript ends the take");
                    watch_dictation(&engine);
                }
            }
            text => {
                if let Err(e) = engine.send(text) {
                    eprintln!("[parlance] send failed: {}", e);
                    continue;
                }
                wait_for_reply(&engine);
            }
        }
    }

    engine.close();
    println!("[parlance] bye");
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Poll until the assistant turn finishes, then print the reply.
fn wait_for_reply(engine: &Conversation) {
    let mut warned = false;
    while engine.awaiting_answer() {
        if !warned && engine.connection_state() == ConnectionState::Reconnecting {
            eprintln!("[parlance] reconnecting...");
            warned = true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    if let Some(reply) = engine
        .messages()
        .into_iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
    {
        println!("assistant> {}", reply.content);
        for reference in &reply.references {
            println!(
                "           [{}] {}",
                reference.display_name, reference.download_url
            );
        }
    }
}

/// Echo the live transcript until the capture session ends, then send the
/// final text it staged in the draft.
fn watch_dictation(engine: &Conversation) {
    let mut last = String::new();
    while engine.capture_status() != CaptureStatus::Idle {
        let draft = engine.draft();
        if draft != last {
            println!("mic> {}", draft);
            last = draft;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    if !engine.draft().trim().is_empty() && engine.submit().is_ok() {
        wait_for_reply(engine);
    }
}
