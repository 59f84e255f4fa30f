use std::sync::atomic::{AtomicBool, Ordering};

/// A static token that is never set.
static TOKEN_DEFAULT: Token = Token::new();

/// A thread safe token that can be set to flag some condition.
///
/// Once set it stays set, so every worker sharing the token observes the
/// cancellation until the session replaces it.
pub struct Token(AtomicBool);

impl Token {
    /// Create a new token.
    pub const fn new() -> Token {
        Token(AtomicBool::new(false))
    }

    /// Access a static token that is never set.
    pub fn default() -> &'static Token {
        &TOKEN_DEFAULT
    }

    /// Set the token.
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Test if the token is set.
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
