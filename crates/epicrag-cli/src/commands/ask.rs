use anyhow::{Context, Result};
use colored::Colorize;
use epicrag_index::{Answer, ChatMessage, RetrievalQa};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::cli::{AskArgs, OutputFormat};
use crate::output::{print_json, print_table, truncate};

pub async fn ask(qa: &RetrievalQa, args: &AskArgs, format: OutputFormat) -> Result<()> {
    match &args.question {
        Some(question) => {
            let answer = qa
                .ask(question, &args.patient, &[])
                .await
                .context("failed to answer question")?;
            print_answer(&answer, args.show_context, format)
        }
        None => interactive(qa, args, format).await,
    }
}

/// Reads questions from stdin until EOF or `exit`, carrying the conversation
/// history between turns.
async fn interactive(qa: &RetrievalQa, args: &AskArgs, format: OutputFormat) -> Result<()> {
    println!(
        "{} patient {} (type 'exit' to quit)",
        "Asking about".cyan(),
        args.patient.bold()
    );
    let mut history: Vec<ChatMessage> = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        if matches!(question, "exit" | "quit") {
            break;
        }

        match qa.ask(question, &args.patient, &history).await {
            Ok(answer) => {
                print_answer(&answer, args.show_context, format)?;
                history.push(ChatMessage::user(question));
                history.push(ChatMessage::assistant(answer.answer));
            }
            Err(e) => crate::output::print_error(&format!("{e}")),
        }
    }
    Ok(())
}

fn print_answer(answer: &Answer, show_context: bool, format: OutputFormat) -> Result<()> {
    if let OutputFormat::Json = format {
        return print_json(answer);
    }
    println!("{}", answer.answer);
    if show_context {
        println!();
        println!("{}", "Context:".cyan());
        println!("{}", answer.context);
    }
    let rows = answer
        .sources
        .iter()
        .map(|s| {
            [
                format!("{:.3}", s.score),
                s.metadata.resource_type.clone(),
                truncate(&s.text, 60),
            ]
        })
        .collect();
    println!();
    print_table(["Score", "Source", "Text"], rows);
    Ok(())
}
