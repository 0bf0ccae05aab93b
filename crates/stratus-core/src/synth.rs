//! Compact-and-refine answer synthesis.
//!
//! Retrieved texts are packed into as few prompts as the model's context
//! window allows. The first pack is answered with a question-answering
//! prompt; each later pack refines the previous answer. Token counts are
//! estimated at four characters per token.

use anyhow::Result;

use crate::llm::{CompletionOptions, LanguageModel};

pub const CHARS_PER_TOKEN: usize = 4;

/// Answer returned when there is no context to synthesize from.
pub const EMPTY_CONTEXT_ANSWER: &str =
    "No relevant information was found in this project for the question.";

const PACK_SEPARATOR: &str = "\n\n";

pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

fn qa_prompt(context: &str, query: &str) -> String {
    format!(
        "Context information is below.\n\
         ---------------------\n\
         {context}\n\
         ---------------------\n\
         Given the context information and not prior knowledge, answer the query.\n\
         Query: {query}\n\
         Answer: "
    )
}

fn refine_prompt(context: &str, query: &str, existing: &str) -> String {
    format!(
        "The original query is as follows: {query}\n\
         We have provided an existing answer: {existing}\n\
         We have the opportunity to refine the existing answer (only if needed) with some more context below.\n\
         ------------\n\
         {context}\n\
         ------------\n\
         Given the new context, refine the original answer to better answer the query. \
         If the context isn't useful, return the original answer.\n\
         Refined Answer: "
    )
}

/// Tokens available for context in one prompt.
///
/// The refine template is the larger of the two. Its prompt carries the
/// previous answer and its reply is a new one; both are bounded by
/// `max_tokens`, so the window pays for `max_tokens` twice.
pub fn context_budget(context_window: usize, opts: &CompletionOptions, query: &str) -> usize {
    let template = estimate_tokens(&refine_prompt("", query, ""));
    let previous_answer = opts.max_tokens;
    let reply = opts.max_tokens;
    context_window
        .saturating_sub(template + previous_answer + reply)
        .max(64)
}

/// Greedily pack `texts` into chunks of at most `budget` tokens.
///
/// Text order is preserved. A single text larger than the budget is split
/// on line boundaries; a single line larger than the budget becomes its
/// own pack.
pub fn pack_context(texts: &[String], budget: usize) -> Vec<String> {
    let max_chars = budget.max(1) * CHARS_PER_TOKEN;
    let mut packs = Vec::new();
    let mut current = String::new();

    let push_piece = |piece: &str, current: &mut String, packs: &mut Vec<String>| {
        let extra = if current.is_empty() {
            piece.len()
        } else {
            piece.len() + PACK_SEPARATOR.len()
        };
        if !current.is_empty() && current.len() + extra > max_chars {
            packs.push(std::mem::take(current));
        }
        if !current.is_empty() {
            current.push_str(PACK_SEPARATOR);
        }
        current.push_str(piece);
    };

    for text in texts {
        if text.trim().is_empty() {
            continue;
        }
        if text.len() <= max_chars {
            push_piece(text, &mut current, &mut packs);
            continue;
        }

        let mut piece = String::new();
        for line in text.lines() {
            if !piece.is_empty() && piece.len() + 1 + line.len() > max_chars {
                push_piece(&piece, &mut current, &mut packs);
                piece.clear();
            }
            if !piece.is_empty() {
                piece.push('\n');
            }
            piece.push_str(line);
        }
        if !piece.trim().is_empty() {
            push_piece(&piece, &mut current, &mut packs);
        }
    }

    if !current.is_empty() {
        packs.push(current);
    }
    packs
}

/// Produce an answer to `query` from `texts` with compact-and-refine.
pub async fn synthesize(
    llm: &dyn LanguageModel,
    query: &str,
    texts: &[String],
    opts: &CompletionOptions,
) -> Result<String> {
    let budget = context_budget(llm.context_window(), opts, query);
    let packs = pack_context(texts, budget);
    if packs.is_empty() {
        return Ok(EMPTY_CONTEXT_ANSWER.to_string());
    }

    let mut answer: Option<String> = None;
    for pack in &packs {
        let prompt = match &answer {
            None => qa_prompt(pack, query),
            Some(existing) => refine_prompt(pack, query, existing),
        };
        let response = llm.complete(&prompt, opts).await?;
        let response = response.trim();
        // A blank reply never replaces an answer; with no answer yet the
        // next pack is asked afresh.
        if !response.is_empty() {
            answer = Some(response.to_string());
        }
    }

    Ok(answer.unwrap_or_else(|| EMPTY_CONTEXT_ANSWER.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Recorder {
        window: usize,
        prompts: Mutex<Vec<String>>,
        /// Calls up to this count reply with whitespace only.
        blank_until: usize,
    }

    impl Recorder {
        fn new(window: usize) -> Self {
            Self {
                window,
                prompts: Mutex::new(Vec::new()),
                blank_until: 0,
            }
        }
    }

    #[async_trait]
    impl LanguageModel for Recorder {
        fn model_name(&self) -> &str {
            "recorder"
        }
        fn context_window(&self) -> usize {
            self.window
        }
        async fn complete(&self, prompt: &str, _opts: &CompletionOptions) -> Result<String> {
            let mut prompts = self.prompts.lock().unwrap();
            prompts.push(prompt.to_string());
            if prompts.len() <= self.blank_until {
                return Ok("  \n".to_string());
            }
            Ok(format!("answer {}", prompts.len()))
        }
    }

    #[test]
    fn test_pack_keeps_order_and_budget() {
        let texts: Vec<String> = (0..10).map(|i| format!("{i}").repeat(30)).collect();
        let packs = pack_context(&texts, 20);
        assert!(packs.len() > 1);
        assert!(packs.iter().all(|p| p.len() <= 80));
        let joined = packs.join(PACK_SEPARATOR);
        assert_eq!(joined, texts.join(PACK_SEPARATOR));
    }

    #[test]
    fn test_pack_splits_oversized_text_on_lines() {
        let big = (0..50).map(|i| format!("line {i:03}")).collect::<Vec<_>>().join("\n");
        let packs = pack_context(&[big], 10);
        assert!(packs.len() > 1);
        assert!(packs.iter().all(|p| p.len() <= 40));
        assert!(packs[0].starts_with("line 000"));
    }

    #[tokio::test]
    async fn test_single_pack_uses_qa_prompt() {
        let llm = Recorder::new(4096);
        let answer = synthesize(
            &llm,
            "what?",
            &["alpha".to_string(), "beta".to_string()],
            &CompletionOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(answer, "answer 1");
        let prompts = llm.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("alpha\n\nbeta"));
        assert!(prompts[0].contains("Query: what?"));
    }

    #[tokio::test]
    async fn test_multiple_packs_refine_previous_answer() {
        let opts = CompletionOptions {
            max_tokens: 16,
            temperature: 0.0,
        };
        let llm = Recorder::new(300);
        let texts: Vec<String> = (0..6).map(|i| format!("fact {i} ").repeat(40)).collect();
        let answer = synthesize(&llm, "q", &texts, &opts).await.unwrap();

        let prompts = llm.prompts.lock().unwrap();
        assert!(prompts.len() > 1);
        assert!(prompts[1].contains("existing answer: answer 1"));
        assert_eq!(answer, format!("answer {}", prompts.len()));
    }

    #[tokio::test]
    async fn test_blank_first_reply_does_not_become_the_answer() {
        let opts = CompletionOptions {
            max_tokens: 16,
            temperature: 0.0,
        };
        let llm = Recorder {
            blank_until: 1,
            ..Recorder::new(300)
        };
        let texts: Vec<String> = (0..6).map(|i| format!("fact {i} ").repeat(40)).collect();
        let answer = synthesize(&llm, "q", &texts, &opts).await.unwrap();

        let prompts = llm.prompts.lock().unwrap();
        assert!(prompts.len() > 2);
        // The second pack is answered afresh, not refined against a blank answer.
        assert!(prompts[1].starts_with("Context information is below."));
        assert!(prompts[2].contains("existing answer: answer 2"));
        assert_eq!(answer, format!("answer {}", prompts.len()));
    }

    #[tokio::test]
    async fn test_all_blank_replies_fall_back_to_no_information() {
        let llm = Recorder {
            blank_until: usize::MAX,
            ..Recorder::new(4096)
        };
        let answer = synthesize(&llm, "q", &["alpha".to_string()], &CompletionOptions::default())
            .await
            .unwrap();
        assert_eq!(answer, EMPTY_CONTEXT_ANSWER);
    }

    #[test]
    fn test_budget_leaves_room_for_previous_and_new_answer() {
        let opts = CompletionOptions {
            max_tokens: 256,
            temperature: 0.0,
        };
        let window = 4096;
        let query = "how is the service deployed?";
        let budget = context_budget(window, &opts, query);

        let context = "c".repeat(budget * CHARS_PER_TOKEN);
        let previous = "a".repeat(opts.max_tokens * CHARS_PER_TOKEN);
        let prompt = refine_prompt(&context, query, &previous);
        assert!(estimate_tokens(&prompt) + opts.max_tokens <= window);
    }

    #[tokio::test]
    async fn test_empty_context_skips_model() {
        let llm = Recorder::new(4096);
        let answer = synthesize(&llm, "q", &[], &CompletionOptions::default())
            .await
            .unwrap();
        assert_eq!(answer, EMPTY_CONTEXT_ANSWER);
        assert!(llm.prompts.lock().unwrap().is_empty());
    }
}
