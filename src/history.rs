//! Bounded, in-memory record of question/answer exchanges.

use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub question: String,
    pub answer: String,
}

/// Keeps the last `max_exchanges` exchanges; older ones fall off the front.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    exchanges: VecDeque<Exchange>,
    max_exchanges: usize,
}

impl ConversationHistory {
    pub fn new(max_exchanges: usize) -> Self {
        Self {
            exchanges: VecDeque::with_capacity(max_exchanges),
            max_exchanges,
        }
    }

    pub fn push(&mut self, question: impl Into<String>, answer: impl Into<String>) {
        if self.max_exchanges == 0 {
            return;
        }
        while self.exchanges.len() >= self.max_exchanges {
            self.exchanges.pop_front();
        }
        self.exchanges.push_back(Exchange {
            question: question.into(),
            answer: answer.into(),
        });
    }

    pub fn clear(&mut self) {
        self.exchanges.clear();
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Exchange> {
        self.exchanges.iter()
    }

    /// `Q: ...\nA: ...` blocks separated by blank lines, oldest first.
    pub fn formatted(&self) -> String {
        self.exchanges
            .iter()
            .map(|e| format!("Q: {}\nA: {}", e.question, e.answer))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}
