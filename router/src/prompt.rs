/// Prompt normalization logic
use crate::validation::ValidationError;
use crate::{ChatMessage, TextInput, TextPart};
use minijinja::{context, Environment, Template};
use std::sync::Arc;

/// ChatML-style template, the default formatting for chat turns.
const CHATML_TEMPLATE: &str = "{% for message in messages %}<|im_start|>{{ message.role }}\n{{ message.content }}<|im_end|>\n{% endfor %}<|im_start|>assistant\n";

/// Bare `role: content` lines, for models without special chat tokens.
const PLAIN_TEMPLATE: &str = "{% for message in messages %}{{ message.role }}: {{ message.content }}\n{% endfor %}assistant:";

/// Shape of a `text` sequence, decided by looking at its elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PromptFormat {
    /// Every element is a `{role, content}` chat turn.
    Chat,
    /// Every element is a flat prompt string.
    Prompts,
}

/// A request's text after normalization, tagged single or sequence so the
/// batch router can pick a strategy and the response can match the input
/// shape. Element order is preserved end-to-end.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum NormalizedPrompt {
    Single(String),
    Sequence(Vec<String>),
}

impl NormalizedPrompt {
    pub(crate) fn len(&self) -> usize {
        match self {
            NormalizedPrompt::Single(_) => 1,
            NormalizedPrompt::Sequence(prompts) => prompts.len(),
        }
    }

    pub(crate) fn into_prompts(self) -> Vec<String> {
        match self {
            NormalizedPrompt::Single(prompt) => vec![prompt],
            NormalizedPrompt::Sequence(prompts) => prompts,
        }
    }

    /// The one prompt of a single-prompt input, if it is one.
    pub(crate) fn into_single(self) -> Option<String> {
        match self {
            NormalizedPrompt::Single(prompt) => Some(prompt),
            NormalizedPrompt::Sequence(prompts) if prompts.len() == 1 => {
                prompts.into_iter().next()
            }
            NormalizedPrompt::Sequence(_) => None,
        }
    }
}

/// The external chat formatting tool: a minijinja template rendered over the
/// request's chat turns.
pub struct ChatTemplate {
    template: Template<'static, 'static>,
}

impl ChatTemplate {
    pub fn new(source: String) -> Result<Self, minijinja::Error> {
        // The template lives for the whole process; leaking the source buys
        // a borrow-free handle.
        let env = Box::leak(Box::new(Environment::new()));
        env.add_template("chat", Box::leak(source.into_boxed_str()))?;
        let template = env.get_template("chat")?;
        Ok(Self { template })
    }

    /// Source of a built-in template, if `name` is one.
    pub fn builtin(name: &str) -> Option<&'static str> {
        match name {
            "chatml" => Some(CHATML_TEMPLATE),
            "plain" => Some(PLAIN_TEMPLATE),
            _ => None,
        }
    }

    fn apply(&self, messages: &[ChatMessage]) -> Result<String, ValidationError> {
        self.template
            .render(context! { messages => messages })
            .map_err(|err| ValidationError::ChatTemplate(err.to_string()))
    }
}

#[derive(Clone)]
pub(crate) struct PromptNormalizer {
    chat_template: Option<Arc<ChatTemplate>>,
}

impl PromptNormalizer {
    pub(crate) fn new(chat_template: Option<ChatTemplate>) -> Self {
        Self {
            chat_template: chat_template.map(Arc::new),
        }
    }

    pub(crate) fn has_chat_template(&self) -> bool {
        self.chat_template.is_some()
    }

    /// Normalize `text` into the prompt shape the engine call needs.
    ///
    /// Chat turns are flattened through the chat template when one is
    /// configured, otherwise each turn passes through as its content string.
    /// Flat prompt sequences pass through unchanged. A single string is
    /// wrapped in a one-element sequence iff `return_as_sequence`.
    pub(crate) fn normalize(
        &self,
        text: TextInput,
        return_as_sequence: bool,
    ) -> Result<NormalizedPrompt, ValidationError> {
        match text {
            TextInput::Single(prompt) => Ok(if return_as_sequence {
                NormalizedPrompt::Sequence(vec![prompt])
            } else {
                NormalizedPrompt::Single(prompt)
            }),
            TextInput::Sequence(parts) => match classify(&parts)? {
                PromptFormat::Chat => {
                    let turns: Vec<ChatMessage> = parts
                        .into_iter()
                        .filter_map(|part| match part {
                            TextPart::ChatTurn(turn) => Some(turn),
                            TextPart::Prompt(_) => None,
                        })
                        .collect();
                    match &self.chat_template {
                        Some(template) => {
                            let prompt = template.apply(&turns)?;
                            Ok(if return_as_sequence {
                                NormalizedPrompt::Sequence(vec![prompt])
                            } else {
                                NormalizedPrompt::Single(prompt)
                            })
                        }
                        None => Ok(NormalizedPrompt::Sequence(
                            turns.into_iter().map(|turn| turn.content).collect(),
                        )),
                    }
                }
                PromptFormat::Prompts => Ok(NormalizedPrompt::Sequence(
                    parts
                        .into_iter()
                        .filter_map(|part| match part {
                            TextPart::Prompt(prompt) => Some(prompt),
                            TextPart::ChatTurn(_) => None,
                        })
                        .collect(),
                )),
            },
        }
    }
}

fn classify(parts: &[TextPart]) -> Result<PromptFormat, ValidationError> {
    let chat_turns = parts
        .iter()
        .filter(|part| matches!(part, TextPart::ChatTurn(_)))
        .count();
    if chat_turns == parts.len() {
        Ok(PromptFormat::Chat)
    } else if chat_turns == 0 {
        Ok(PromptFormat::Prompts)
    } else {
        Err(ValidationError::InvalidPromptFormat)
    }
}
