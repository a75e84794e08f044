//! Splits text into lowercase search terms.

use logos::Logos;

#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
#[logos(skip r"[^\p{L}\p{N}]+")]
enum Token {
    #[regex(r"[\p{L}\p{N}]+")]
    Word,
}

/// Lowercased words of `text`, in order, duplicates included.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    let mut lexer = Token::lexer(text);
    let mut terms = Vec::new();
    while let Some(token) = lexer.next() {
        if let Ok(Token::Word) = token {
            terms.push(lexer.slice().to_lowercase());
        }
    }
    terms
}

/// Distinct terms of a query, in first-seen order.
pub(crate) fn query_terms(text: &str) -> Vec<String> {
    let mut terms = tokenize(text);
    let mut seen = std::collections::HashSet::new();
    terms.retain(|term| seen.insert(term.clone()));
    terms
}
