//! Natural-language command parser
//!
//! Grammar (case-insensitive, amounts in dollars with at most two decimals):
//!
//! ```text
//! send|pay $AMOUNT to RECIPIENT
//! buy $AMOUNT [of] SYMBOL
//! sell $AMOUNT [of] SYMBOL
//! reserve|save $AMOUNT for PURPOSE
//! ```

use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::core_types::Cents;
use crate::error::{EngineError, EngineResult};

use super::types::CommandAction;

/// Parse `"$1,234.50"` / `"20"` into cents
pub fn parse_amount(raw: &str) -> EngineResult<Cents> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches('$')
        .chars()
        .filter(|c| *c != ',')
        .collect();
    let value = Decimal::from_str(&cleaned)
        .map_err(|_| EngineError::Parse(format!("invalid amount '{raw}'")))?;
    if value.scale() > 2 {
        return Err(EngineError::Parse(format!(
            "amount '{raw}' has more than two decimals"
        )));
    }
    if value <= Decimal::ZERO {
        return Err(EngineError::Parse(format!("amount '{raw}' must be positive")));
    }
    (value * Decimal::ONE_HUNDRED)
        .to_i64()
        .ok_or_else(|| EngineError::Parse(format!("amount '{raw}' is too large")))
}

pub fn parse(text: &str) -> EngineResult<CommandAction> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let Some((verb, rest)) = tokens.split_first() else {
        return Err(EngineError::Parse("empty command".into()));
    };

    match verb.to_ascii_lowercase().as_str() {
        "send" | "pay" => {
            let (amount, tail) = amount_then(rest, "to")?;
            Ok(CommandAction::Send {
                recipient: phrase(tail, "recipient")?,
                amount_cents: amount,
            })
        }
        "buy" | "sell" => {
            let (amount, tail) = match rest.split_first() {
                Some((raw, tail)) => (parse_amount(raw)?, tail),
                None => return Err(EngineError::Parse(format!("'{verb}' needs an amount"))),
            };
            let tail = match tail.split_first() {
                Some((of, tail)) if of.eq_ignore_ascii_case("of") => tail,
                _ => tail,
            };
            let symbol = match tail {
                [symbol] => symbol.to_ascii_uppercase(),
                _ => return Err(EngineError::Parse(format!("'{verb}' needs one symbol"))),
            };
            if !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(EngineError::Parse(format!("invalid symbol '{symbol}'")));
            }
            if verb.eq_ignore_ascii_case("buy") {
                Ok(CommandAction::Buy {
                    symbol,
                    amount_cents: amount,
                })
            } else {
                Ok(CommandAction::Sell {
                    symbol,
                    amount_cents: amount,
                })
            }
        }
        "reserve" | "save" => {
            let (amount, tail) = amount_then(rest, "for")?;
            Ok(CommandAction::Reserve {
                purpose: phrase(tail, "purpose")?,
                amount_cents: amount,
            })
        }
        other => Err(EngineError::Parse(format!("unknown action '{other}'"))),
    }
}

/// `$AMOUNT <keyword> ...` -> (cents, words after keyword)
fn amount_then<'a>(rest: &'a [&'a str], keyword: &str) -> EngineResult<(Cents, &'a [&'a str])> {
    match rest {
        [raw, kw, tail @ ..] if kw.eq_ignore_ascii_case(keyword) => Ok((parse_amount(raw)?, tail)),
        _ => Err(EngineError::Parse(format!("expected '<amount> {keyword} ...'"))),
    }
}

fn phrase(words: &[&str], what: &str) -> EngineResult<String> {
    if words.is_empty() {
        return Err(EngineError::Parse(format!("missing {what}")));
    }
    Ok(words.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("$20").unwrap(), 2_000);
        assert_eq!(parse_amount("20.5").unwrap(), 2_050);
        assert_eq!(parse_amount("$1,234.56").unwrap(), 123_456);
        assert!(parse_amount("$0").is_err());
        assert!(parse_amount("$1.234").is_err());
        assert!(parse_amount("abc").is_err());
        assert!(parse_amount("-5").is_err());
    }

    #[test]
    fn test_parse_send() {
        assert_eq!(
            parse("send $20 to alice").unwrap(),
            CommandAction::Send {
                recipient: "alice".into(),
                amount_cents: 2_000
            }
        );
        assert_eq!(
            parse("Pay 12.50 to Bob Smith").unwrap(),
            CommandAction::Send {
                recipient: "Bob Smith".into(),
                amount_cents: 1_250
            }
        );
    }

    #[test]
    fn test_parse_trades() {
        assert_eq!(
            parse("buy $50 of btc").unwrap(),
            CommandAction::Buy {
                symbol: "BTC".into(),
                amount_cents: 5_000
            }
        );
        assert_eq!(
            parse("SELL 30 ETH").unwrap(),
            CommandAction::Sell {
                symbol: "ETH".into(),
                amount_cents: 3_000
            }
        );
    }

    #[test]
    fn test_parse_reserve() {
        assert_eq!(
            parse("reserve $100 for rent").unwrap(),
            CommandAction::Reserve {
                purpose: "rent".into(),
                amount_cents: 10_000
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        for text in [
            "",
            "launch $5 to mars",
            "send $20 alice",
            "send $20 to",
            "buy $50",
            "buy $50 of btc eth",
            "buy $50 of b-c",
            "reserve for rent",
        ] {
            assert!(
                matches!(parse(text), Err(EngineError::Parse(_))),
                "expected parse error for {text:?}"
            );
        }
    }
}
