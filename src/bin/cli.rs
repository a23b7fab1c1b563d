// Quiz Room CLI Validation Tool
// Drives the quiz room server over HTTP and WebSocket for manual checks

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::*;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_tungstenite::{connect_async, tungstenite::Message};

#[derive(Parser)]
#[command(name = "quiz-cli")]
#[command(about = "Quiz Room Server CLI Validation Tool", long_about = None)]
struct Cli {
    /// Server address (default: 127.0.0.1:8080)
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Bearer token used for HTTP actions
    #[arg(short, long)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check server health endpoint
    Health,

    /// Create a quiz event from a quiz definition file (teacher)
    Create {
        /// Quiz event name
        #[arg(short, long)]
        name: String,

        /// Path to the quiz definition JSON
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Pre-register for a quiz event
    Join {
        /// Channel code of the event
        #[arg(short, long)]
        channel_code: String,
    },

    /// Start a quiz event (owner)
    Start {
        #[arg(short, long)]
        quiz_id: u64,
    },

    /// End a quiz event now (owner)
    End {
        #[arg(short, long)]
        quiz_id: u64,
    },

    /// List results of a quiz event (owner)
    Results {
        #[arg(short, long)]
        quiz_id: u64,
    },

    /// Open an interactive room connection
    Connect {
        /// Channel code of the room
        #[arg(short, long)]
        channel_code: String,

        /// Your user id
        #[arg(short, long)]
        user_id: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let token = cli.token.as_deref();

    match &cli.command {
        Commands::Health => {
            check_health(&cli.server).await;
        }
        Commands::Create { name, file } => {
            create_quiz(&cli.server, token, name, file).await;
        }
        Commands::Join { channel_code } => {
            let body = json!({ "channel_code": channel_code });
            post_action(&cli.server, token, "quiz/join", Some(body), "Joined quiz event").await;
        }
        Commands::Start { quiz_id } => {
            let path = format!("quiz/{}/start", quiz_id);
            post_action(&cli.server, token, &path, None, "Quiz event started").await;
        }
        Commands::End { quiz_id } => {
            let path = format!("quiz/{}/end", quiz_id);
            post_action(&cli.server, token, &path, None, "Quiz event ended").await;
        }
        Commands::Results { quiz_id } => {
            show_results(&cli.server, token, *quiz_id).await;
        }
        Commands::Connect {
            channel_code,
            user_id,
        } => {
            interactive_mode(&cli.server, channel_code, *user_id).await;
        }
    }
}

async fn check_health(server: &str) {
    println!("{}", "Checking server health...".cyan());

    let url = format!("http://{}/health", server);
    let client = reqwest::Client::new();

    match client.get(&url).send().await {
        Ok(resp) => {
            let status = resp.status();
            if status.is_success() {
                println!("{} Health check passed", "✓".green());

                if let Ok(body) = resp.json::<Value>().await {
                    println!("  Status: {}", body["status"].as_str().unwrap_or("unknown"));
                    println!("  Service: {}", body["service"].as_str().unwrap_or("unknown"));
                    println!("  Version: {}", body["version"].as_str().unwrap_or("unknown"));
                }
            } else {
                println!("{} Health check failed: {}", "✗".red(), status);
            }
        }
        Err(e) => {
            println!("{} Cannot connect to server: {}", "✗".red(), e);
            println!("  Make sure the server is running on {}", server);
        }
    }
}

async fn create_quiz(server: &str, token: Option<&str>, name: &str, file: &PathBuf) {
    println!("{}", "Creating quiz event...".cyan());

    let quiz_json = match std::fs::read_to_string(file)
        .map_err(|e| e.to_string())
        .and_then(|data| serde_json::from_str::<Value>(&data).map_err(|e| e.to_string()))
    {
        Ok(value) => value,
        Err(e) => {
            println!("{} Cannot read {}: {}", "✗".red(), file.display(), e);
            return;
        }
    };

    let body = json!({ "quiz_event_name": name, "quiz_json": quiz_json });
    let Some(response) = send_request(server, token, reqwest::Method::POST, "quiz", Some(body)).await
    else {
        return;
    };

    println!("{} Quiz event created!", "✓".green());
    println!("\n{}", "═".repeat(50).green());
    println!(
        "{} {}",
        "Channel code:".bold(),
        response["channel_code"].as_str().unwrap_or("unknown").green().bold()
    );
    println!("{} {}", "Quiz id:".bold(), response["quiz_event"]["id"]);
    println!(
        "{} {}",
        "WebSocket:".bold(),
        response["websocket_url"].as_str().unwrap_or("unknown")
    );
    println!("{}", "═".repeat(50).green());
}

async fn post_action(server: &str, token: Option<&str>, path: &str, body: Option<Value>, done: &str) {
    if let Some(response) = send_request(server, token, reqwest::Method::POST, path, body).await {
        println!("{} {}", "✓".green(), done);
        print_json(&response);
    }
}

async fn show_results(server: &str, token: Option<&str>, quiz_id: u64) {
    let path = format!("quiz/{}/results", quiz_id);
    let Some(response) = send_request(server, token, reqwest::Method::GET, &path, None).await else {
        return;
    };

    let results = response.as_array().cloned().unwrap_or_default();
    println!("{} {} result(s)", "✓".green(), results.len());
    for result in results {
        println!(
            "  user {:>6}  score {:>5}  correct {}  wrong {}",
            result["user_id"],
            result["exp_score"],
            result["extra_json_info"]["correct_answers"],
            result["extra_json_info"]["wrong_answers"]
        );
    }
}

async fn send_request(
    server: &str,
    token: Option<&str>,
    method: reqwest::Method,
    path: &str,
    body: Option<Value>,
) -> Option<Value> {
    let Some(token) = token else {
        println!("{} This command needs {}", "✗".red(), "--token".cyan());
        return None;
    };

    let url = format!("http://{}/{}", server, path);
    let mut request = reqwest::Client::new()
        .request(method, &url)
        .bearer_auth(token);
    if let Some(body) = body {
        request = request.json(&body);
    }

    match request.send().await {
        Ok(resp) => {
            let status = resp.status();
            let body = resp.json::<Value>().await.unwrap_or(Value::Null);
            if status.is_success() {
                Some(body)
            } else {
                println!(
                    "{} Request failed ({}): {}",
                    "✗".red(),
                    status,
                    body["error"].as_str().unwrap_or("unknown error")
                );
                None
            }
        }
        Err(e) => {
            println!("{} Cannot connect to server: {}", "✗".red(), e);
            None
        }
    }
}

fn print_json(value: &Value) {
    if let Ok(pretty) = serde_json::to_string_pretty(value) {
        println!("{}", pretty);
    }
}

async fn interactive_mode(server: &str, channel_code: &str, user_id: u64) {
    println!("\n{}", "Interactive Mode".bold().green());
    println!("{}", "═".repeat(60).green());
    println!("Type {} for help, {} to quit\n", "help".cyan(), "quit".cyan());

    let url = format!(
        "ws://{}/ws?channel_code={}&user_id={}",
        server,
        urlencoding::encode(channel_code),
        user_id
    );

    let (ws_stream, _) = match connect_async(&url).await {
        Ok(connection) => connection,
        Err(e) => {
            println!("{} Cannot connect to server: {}", "✗".red(), e);
            return;
        }
    };
    println!("{} Connected to room {}", "✓".green(), channel_code.green().bold());

    let (mut write, mut read) = ws_stream.split();

    // Spawn task to receive messages
    let receive_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = read.next().await {
            match msg {
                Message::Text(text) => println!("\n{} {}", "◀".green(), text.bright_white()),
                Message::Close(_) => {
                    println!("\n{} Server closed the connection", "✗".yellow());
                    break;
                }
                _ => {}
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "quit" || input == "exit" {
            println!("Goodbye!");
            break;
        }
        if input == "help" {
            print_interactive_help();
            continue;
        }

        match parse_command(input) {
            Ok(frame) => {
                if write.send(Message::Text(frame.to_string())).await.is_ok() {
                    println!("{} Message sent", "✓".green());
                } else {
                    println!("{} Failed to send message", "✗".red());
                    break;
                }
            }
            Err(e) => println!("{} {}. Type 'help' for examples.", "✗".yellow(), e),
        }
    }

    let _ = write.send(Message::Close(None)).await;
    receive_task.abort();
}

/// Turns one stdin line into a protocol frame.
fn parse_command(input: &str) -> Result<Value, String> {
    let (command, rest) = input.split_once(' ').unwrap_or((input, ""));
    let rest = rest.trim();

    match command {
        "clients" => Ok(json!({ "type": "get_clients", "payload": {} })),
        "remove" => {
            let ids = rest
                .split(',')
                .map(|id| id.trim().parse::<u64>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| "usage: remove <id,id,...>".to_string())?;
            Ok(json!({ "type": "remove_clients", "payload": { "client_list": ids } }))
        }
        "answer" => {
            let (question_id, answer) = rest
                .split_once(' ')
                .ok_or_else(|| "usage: answer <question_id> <json>".to_string())?;
            let question_id: u32 = question_id
                .parse()
                .map_err(|_| format!("invalid question id: {}", question_id))?;
            let answer: Value = serde_json::from_str(answer.trim())
                .map_err(|e| format!("invalid answer JSON: {}", e))?;
            Ok(json!({
                "type": "answer",
                "payload": { "question_id": question_id, "answer": answer }
            }))
        }
        _ if input.starts_with('{') => {
            serde_json::from_str(input).map_err(|e| format!("invalid JSON: {}", e))
        }
        other => Err(format!("unknown command: {}", other)),
    }
}

fn print_interactive_help() {
    println!("\n{}", "Interactive Mode Commands".bold());
    println!("{}", "─".repeat(60));

    println!("\n{}:", "Answer a question".cyan());
    println!("  answer 1 \"Paris\"");
    println!("  answer 2 [\"a\",\"c\"]");
    println!("  answer 3 27");

    println!("\n{} (moderator):", "List participants".cyan());
    println!("  clients");

    println!("\n{} (moderator):", "Remove participants".cyan());
    println!("  remove 12,13");

    println!("\n{}:", "Raw frame".cyan());
    println!(r#"  {{"type":"get_clients","payload":{{}}}}"#);

    println!("\n{}: quit, exit", "Commands".bold());
    println!();
}
