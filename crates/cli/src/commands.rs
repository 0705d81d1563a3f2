//! Slash commands of the interactive session.

use std::sync::Arc;

use minerva_agent::controller::{Agent, Services};
use minerva_agent::{deep_research, summarize_document};
use minerva_memory::consolidate;

use crate::Colors;

/// Handle one slash command (`rest` is the line without the leading `/`).
pub async fn dispatch(rest: &str, services: &Arc<Services>, agent: &mut Agent, colors: &Colors) {
    let mut parts = rest.splitn(2, ' ');
    let command = parts.next().unwrap_or_default();
    let argument = parts.next().map(str::trim).unwrap_or_default();

    match command {
        "reload" => match services.registry.reload() {
            Ok(count) => println!("{}tools reloaded: {count} registered.{}", colors.ok, colors.reset),
            Err(err) => println!("{}reload failed: {err}{}", colors.fail, colors.reset),
        },

        "ozetle" => {
            if argument.is_empty() {
                println!("{}usage: /ozetle <path>{}", colors.warn, colors.reset);
                return;
            }
            let text = match std::fs::read_to_string(argument) {
                Ok(text) => text,
                Err(err) => {
                    println!("{}could not read '{argument}': {err}{}", colors.fail, colors.reset);
                    return;
                }
            };
            println!("{}summarising {argument}...{}", colors.info, colors.reset);
            match summarize_document(
                &services.llm,
                &text,
                services.config.runtime.summary_max_workers,
            )
            .await
            {
                Ok(summary) => println!("{}{summary}{}", colors.ok, colors.reset),
                Err(err) => println!("{}summarisation failed: {err}{}", colors.fail, colors.reset),
            }
        }

        "ozetle_hafiza" => {
            println!("{}consolidating memory...{}", colors.info, colors.reset);
            match consolidate(&services.memory, &services.llm, 1).await {
                Ok(report) => println!(
                    "{}done: {} notes merged into {} summaries, {} deleted.{}",
                    colors.ok, report.source_notes, report.new_notes, report.deleted, colors.reset
                ),
                Err(err) => println!("{}consolidation failed: {err}{}", colors.fail, colors.reset),
            }
        }

        "notlarim" => {
            let notes = if argument.is_empty() {
                services
                    .personal
                    .topics()
                    .into_iter()
                    .flat_map(|topic| services.personal.notes_by_topic(&topic))
                    .collect::<Vec<_>>()
            } else {
                services.personal.notes_by_topic(argument)
            };
            if notes.is_empty() {
                println!("{}no notes found.{}", colors.warn, colors.reset);
                return;
            }
            for note in notes {
                println!("{}[{}]{} {}", colors.info, note.topic, colors.reset, note.text);
            }
        }

        "konularim" => {
            let topics = services.personal.topics();
            if topics.is_empty() {
                println!("{}no topics yet.{}", colors.warn, colors.reset);
            } else {
                println!("{}topics: {}{}", colors.info, topics.join(", "), colors.reset);
            }
        }

        "felsefe" => {
            let topic_prompt = "Name one philosophical school, thinker or concept worth \
                                studying next. Reply with just the subject, a few words.";
            let topic = match services.llm.complete(topic_prompt, 32).await {
                Ok(topic) if !topic.trim().is_empty() => topic.trim().to_string(),
                _ => "stoic philosophy".to_string(),
            };
            println!("{}studying: {topic}{}", colors.header, colors.reset);
            match deep_research(services, agent.tool_ctx(), &topic).await {
                Ok(Some(report)) => {
                    let note = format!("Philosophy study on '{topic}':\n{report}");
                    match services
                        .personal
                        .add(&note, "philosophy", Default::default(), true)
                        .await
                    {
                        Ok(_) => println!("{}{report}{}", colors.ok, colors.reset),
                        Err(err) => {
                            println!("{}could not save the study: {err}{}", colors.fail, colors.reset)
                        }
                    }
                }
                Ok(None) => println!(
                    "{}that subject is already well covered in memory.{}",
                    colors.info, colors.reset
                ),
                Err(err) => println!("{}research failed: {err}{}", colors.fail, colors.reset),
            }
        }

        "not" => {
            let mut note_parts = argument.splitn(2, ' ');
            let topic = note_parts.next().unwrap_or_default();
            let content = note_parts.next().map(str::trim).unwrap_or_default();
            if topic.is_empty() || content.is_empty() {
                println!("{}usage: /not <topic> <content>{}", colors.warn, colors.reset);
                return;
            }
            match services
                .personal
                .add(content, topic, Default::default(), false)
                .await
            {
                Ok(id) => println!("{}note saved ({id}).{}", colors.ok, colors.reset),
                Err(err) => println!("{}could not save the note: {err}{}", colors.fail, colors.reset),
            }
        }

        other => println!(
            "{}unknown command '/{other}'. Available: /reload, /ozetle <path>, \
             /ozetle_hafiza, /notlarim [topic], /konularim, /felsefe, /not <topic> <content>{}",
            colors.warn, colors.reset
        ),
    }
}
