//! Fingerprint categorization
//!
//! An ordered rule table maps a fingerprint to a complexity tier and a fix
//! strategy. SIMPLE problems have a mechanical line-local remedy, MEDIUM ones
//! are known obsolete symbols with a modern replacement, and everything else
//! is COMPLEX and goes back to the generator with focused instructions.

use crate::fixer::FixAction;
use crate::normalize::Fingerprint;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Simple,
    Medium,
    Complex,
}

impl Tier {
    pub fn label(&self) -> &'static str {
        match self {
            Tier::Simple => "SIMPLE",
            Tier::Medium => "MEDIUM",
            Tier::Complex => "COMPLEX",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A built-in remedy: candidate line actions, tried in order.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltinRemedy {
    pub actions: Vec<FixAction>,
    pub confidence: f64,
}

impl BuiltinRemedy {
    /// First action that changes `line`, with the rewritten line.
    pub fn apply(&self, line: &str) -> Option<(&FixAction, String)> {
        self.actions
            .iter()
            .find_map(|action| action.apply(line).map(|fixed| (action, fixed)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Category {
    pub tier: Tier,
    pub kind: &'static str,
    pub strategy: &'static str,
    pub remedy: Option<BuiltinRemedy>,
}

/// An obsolete API name and its modern spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeprecatedSymbol {
    /// Name as it appears quoted in compiler output
    pub name: &'static str,
    /// Source text to replace
    pub obsolete: &'static str,
    pub modern: &'static str,
}

pub const DEPRECATED_SYMBOLS: &[DeprecatedSymbol] = &[
    DeprecatedSymbol {
        name: "MarketInfo",
        obsolete: "MarketInfo(Symbol(), MODE_ASK)",
        modern: "SymbolInfoDouble(_Symbol, SYMBOL_ASK)",
    },
    DeprecatedSymbol {
        name: "MarketInfo",
        obsolete: "MarketInfo(Symbol(), MODE_BID)",
        modern: "SymbolInfoDouble(_Symbol, SYMBOL_BID)",
    },
    DeprecatedSymbol {
        name: "MarketInfo",
        obsolete: "MarketInfo(Symbol(), MODE_POINT)",
        modern: "SymbolInfoDouble(_Symbol, SYMBOL_POINT)",
    },
    DeprecatedSymbol {
        name: "MarketInfo",
        obsolete: "MarketInfo(Symbol(), MODE_DIGITS)",
        modern: "(int)SymbolInfoInteger(_Symbol, SYMBOL_DIGITS)",
    },
    DeprecatedSymbol {
        name: "Ask",
        obsolete: "Ask",
        modern: "SymbolInfoDouble(_Symbol, SYMBOL_ASK)",
    },
    DeprecatedSymbol {
        name: "Bid",
        obsolete: "Bid",
        modern: "SymbolInfoDouble(_Symbol, SYMBOL_BID)",
    },
    DeprecatedSymbol {
        name: "Point",
        obsolete: "Point",
        modern: "_Point",
    },
    DeprecatedSymbol {
        name: "Digits",
        obsolete: "Digits",
        modern: "_Digits",
    },
    DeprecatedSymbol {
        name: "OP_BUY",
        obsolete: "OP_BUY",
        modern: "ORDER_TYPE_BUY",
    },
    DeprecatedSymbol {
        name: "OP_SELL",
        obsolete: "OP_SELL",
        modern: "ORDER_TYPE_SELL",
    },
    DeprecatedSymbol {
        name: "OP_BUYLIMIT",
        obsolete: "OP_BUYLIMIT",
        modern: "ORDER_TYPE_BUY_LIMIT",
    },
    DeprecatedSymbol {
        name: "OP_SELLLIMIT",
        obsolete: "OP_SELLLIMIT",
        modern: "ORDER_TYPE_SELL_LIMIT",
    },
    DeprecatedSymbol {
        name: "OP_BUYSTOP",
        obsolete: "OP_BUYSTOP",
        modern: "ORDER_TYPE_BUY_STOP",
    },
    DeprecatedSymbol {
        name: "OP_SELLSTOP",
        obsolete: "OP_SELLSTOP",
        modern: "ORDER_TYPE_SELL_STOP",
    },
    DeprecatedSymbol {
        name: "AccountBalance",
        obsolete: "AccountBalance()",
        modern: "AccountInfoDouble(ACCOUNT_BALANCE)",
    },
    DeprecatedSymbol {
        name: "AccountEquity",
        obsolete: "AccountEquity()",
        modern: "AccountInfoDouble(ACCOUNT_EQUITY)",
    },
    DeprecatedSymbol {
        name: "AccountFreeMargin",
        obsolete: "AccountFreeMargin()",
        modern: "AccountInfoDouble(ACCOUNT_MARGIN_FREE)",
    },
    DeprecatedSymbol {
        name: "AccountProfit",
        obsolete: "AccountProfit()",
        modern: "AccountInfoDouble(ACCOUNT_PROFIT)",
    },
    DeprecatedSymbol {
        name: "OrdersTotal",
        obsolete: "OrdersTotal()",
        modern: "PositionsTotal()",
    },
];

// Names that always discriminate, even when they contain digits.
const KNOWN_SYMBOLS: &[&str] = &[
    "oninit",
    "ondeinit",
    "ontick",
    "ontimer",
    "ontrade",
    "onchartevent",
    "ctrade",
    "ordersend",
    "positionstotal",
    "symbolinfodouble",
    "symbolinfointeger",
    "accountinfodouble",
];

/// Whether a lowercase token is a symbol the rule tables know by name.
pub fn is_known_symbol(lower: &str) -> bool {
    KNOWN_SYMBOLS.contains(&lower)
        || DEPRECATED_SYMBOLS
            .iter()
            .any(|s| s.name.eq_ignore_ascii_case(lower))
}

const SIMPLE_STRATEGY: &str = "apply a line-local mechanical edit";
const MEDIUM_STRATEGY: &str = "substitute the modern equivalent";
const COMPLEX_STRATEGY: &str = "regenerate with focused instructions";

struct Rule {
    kind: &'static str,
    pattern: &'static str,
    remedy: Option<(&'static str, f64)>,
}

const SIMPLE_RULES: &[Rule] = &[
    Rule {
        kind: "missing_semicolon",
        pattern: r"';' - .*expected|expected ';'|missing ';'|semicolon expected",
        remedy: Some((";", 0.95)),
    },
    Rule {
        kind: "missing_parenthesis",
        pattern: r"'\)' - .*expected|expected '\)'|missing '\)'|unbalanced parenthes",
        remedy: Some((")", 0.90)),
    },
    Rule {
        kind: "missing_brace",
        pattern: r"'\}' - .*expected|expected '\}'|missing '\}'|unbalanced (?:brace|curly)",
        remedy: Some(("}", 0.80)),
    },
    Rule {
        kind: "missing_bracket",
        pattern: r"'\]' - .*expected|expected '\]'|missing '\]'|unbalanced bracket",
        remedy: Some(("]", 0.80)),
    },
    Rule {
        kind: "unexpected_eof",
        pattern: r"unexpected end of (?:file|program|input)|missing terminat|unterminated",
        remedy: None,
    },
];

const COMPLEX_RULES: &[Rule] = &[
    Rule {
        kind: "missing_function",
        pattern: r"function not defined|undefined reference|function .* not found|no matching function",
        remedy: None,
    },
    Rule {
        kind: "missing_include",
        pattern: r"can't open .*include|cannot open include|no such file",
        remedy: None,
    },
    Rule {
        kind: "wrong_parameters",
        pattern: r"wrong parameters count|too (?:many|few) arguments|parameter .* mismatch",
        remedy: None,
    },
    Rule {
        kind: "type_mismatch",
        pattern: r"cannot convert|type mismatch|incompatible types|implicit conversion",
        remedy: None,
    },
    Rule {
        kind: "undeclared_identifier",
        pattern: r"undeclared identifier|not declared|undefined (?:identifier|variable)",
        remedy: None,
    },
];

fn compile_rules(rules: &'static [Rule]) -> Vec<(Regex, &'static Rule)> {
    rules
        .iter()
        .filter_map(|rule| Regex::new(rule.pattern).ok().map(|re| (re, rule)))
        .collect()
}

fn simple_rules() -> &'static [(Regex, &'static Rule)] {
    static RULES: OnceLock<Vec<(Regex, &'static Rule)>> = OnceLock::new();
    RULES.get_or_init(|| compile_rules(SIMPLE_RULES))
}

fn complex_rules() -> &'static [(Regex, &'static Rule)] {
    static RULES: OnceLock<Vec<(Regex, &'static Rule)>> = OnceLock::new();
    RULES.get_or_init(|| compile_rules(COMPLEX_RULES))
}

fn quoted_deprecated_names() -> &'static [String] {
    static NAMES: OnceLock<Vec<String>> = OnceLock::new();
    NAMES.get_or_init(|| {
        let mut names: Vec<String> = Vec::new();
        for symbol in DEPRECATED_SYMBOLS {
            let quoted = format!("'{}'", symbol.name.to_lowercase());
            if !names.contains(&quoted) {
                names.push(quoted);
            }
        }
        names
    })
}

/// Name of the deprecated symbol a fingerprint complains about, if any.
fn deprecated_name(fingerprint: &Fingerprint) -> Option<&'static str> {
    let text = fingerprint.as_str();
    let quoted = quoted_deprecated_names().iter().find(|q| text.contains(*q))?;
    let bare = quoted.trim_matches('\'');
    DEPRECATED_SYMBOLS
        .iter()
        .find(|s| s.name.eq_ignore_ascii_case(bare))
        .map(|s| s.name)
}

fn deprecated_remedy(name: &str) -> BuiltinRemedy {
    let mut actions = Vec::new();
    let mut is_call = false;
    for symbol in DEPRECATED_SYMBOLS.iter().filter(|s| s.name == name) {
        is_call |= symbol.obsolete.contains('(');
        actions.push(FixAction::Replace {
            find: symbol.obsolete.to_string(),
            replace: symbol.modern.to_string(),
        });
    }
    BuiltinRemedy {
        actions,
        confidence: if is_call { 0.85 } else { 0.80 },
    }
}

/// Classify a fingerprint. Total: anything unrecognized is COMPLEX.
pub fn categorize(fingerprint: &Fingerprint) -> Category {
    let text = fingerprint.as_str();

    for (re, rule) in simple_rules() {
        if re.is_match(text) {
            return Category {
                tier: Tier::Simple,
                kind: rule.kind,
                strategy: SIMPLE_STRATEGY,
                remedy: rule.remedy.map(|(suffix, confidence)| BuiltinRemedy {
                    actions: vec![FixAction::Append {
                        suffix: suffix.to_string(),
                    }],
                    confidence,
                }),
            };
        }
    }

    if let Some(name) = deprecated_name(fingerprint) {
        return Category {
            tier: Tier::Medium,
            kind: "deprecated_symbol",
            strategy: MEDIUM_STRATEGY,
            remedy: Some(deprecated_remedy(name)),
        };
    }

    let kind = complex_rules()
        .iter()
        .find(|(re, _)| re.is_match(text))
        .map(|(_, rule)| rule.kind)
        .unwrap_or("unclassified");

    Category {
        tier: Tier::Complex,
        kind,
        strategy: COMPLEX_STRATEGY,
        remedy: None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prioritized {
    pub fingerprint: Fingerprint,
    pub category: Category,
    pub occurrences: u32,
}

/// Order a batch for fixing: SIMPLE before MEDIUM before COMPLEX, then by
/// occurrence count (descending), then by fingerprint for determinism.
pub fn prioritize<I>(batch: I) -> Vec<Prioritized>
where
    I: IntoIterator<Item = (Fingerprint, u32)>,
{
    let mut items: Vec<Prioritized> = batch
        .into_iter()
        .map(|(fingerprint, occurrences)| Prioritized {
            category: categorize(&fingerprint),
            fingerprint,
            occurrences,
        })
        .collect();
    items.sort_by(|a, b| {
        (a.category.tier, Reverse(a.occurrences), &a.fingerprint).cmp(&(
            b.category.tier,
            Reverse(b.occurrences),
            &b.fingerprint,
        ))
    });
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;

    fn tier_of(raw: &str) -> Tier {
        categorize(&normalize(raw)).tier
    }

    #[test]
    fn test_rule_tables_compile() {
        assert_eq!(simple_rules().len(), SIMPLE_RULES.len());
        assert_eq!(complex_rules().len(), COMPLEX_RULES.len());
    }

    #[test]
    fn test_punctuation_is_simple() {
        assert_eq!(tier_of("ea.mq5(10,5) : error 141: ';' - semicolon expected"), Tier::Simple);
        assert_eq!(tier_of("expected ')' at line 45"), Tier::Simple);
        assert_eq!(tier_of("'}' - unexpected end of program"), Tier::Simple);
        assert_eq!(tier_of("unexpected end of file"), Tier::Simple);
    }

    #[test]
    fn test_deprecated_symbols_are_medium() {
        let category = categorize(&normalize("'MarketInfo' - undeclared identifier"));
        assert_eq!(category.tier, Tier::Medium);
        assert_eq!(category.kind, "deprecated_symbol");
        let remedy = category.remedy.unwrap();
        assert_eq!(remedy.actions.len(), 4);
        assert_eq!(remedy.confidence, 0.85);

        let variable = categorize(&normalize("'Ask' - undeclared identifier"));
        assert_eq!(variable.tier, Tier::Medium);
        assert_eq!(variable.remedy.unwrap().confidence, 0.80);

        assert_eq!(tier_of("'OP_BUY' - undeclared identifier"), Tier::Medium);
    }

    #[test]
    fn test_everything_else_is_complex() {
        let category = categorize(&normalize("'OnTick' - function not defined"));
        assert_eq!(category.tier, Tier::Complex);
        assert_eq!(category.kind, "missing_function");
        assert!(category.remedy.is_none());

        assert_eq!(tier_of("'CTrade' - declaration without type"), Tier::Complex);
        assert_eq!(tier_of(""), Tier::Complex);
        assert_eq!(categorize(&normalize("something odd")).kind, "unclassified");
    }

    #[test]
    fn test_generated_identifiers_are_not_deprecated() {
        // "asked1" collapses to <id> and must not match 'ask'
        assert_eq!(tier_of("'asked1' - undeclared identifier"), Tier::Complex);
        assert_eq!(tier_of("'Asking' - undeclared identifier"), Tier::Complex);
    }

    #[test]
    fn test_remedy_picks_matching_variant() {
        let remedy = categorize(&normalize("'MarketInfo' - undeclared identifier"))
            .remedy
            .unwrap();
        let (_, fixed) = remedy
            .apply("double bid = MarketInfo(Symbol(), MODE_BID);")
            .unwrap();
        assert_eq!(fixed, "double bid = SymbolInfoDouble(_Symbol, SYMBOL_BID);");
        assert!(remedy.apply("double x = 1;").is_none());
    }

    #[test]
    fn test_prioritize_orders_by_tier_then_occurrences() {
        let batch = vec![
            (normalize("'OnTick' - function not defined"), 9),
            (normalize("'Ask' - undeclared identifier"), 1),
            (normalize("expected ')'"), 1),
            (normalize("';' - semicolon expected"), 3),
        ];
        let ordered = prioritize(batch);
        let kinds: Vec<&str> = ordered.iter().map(|p| p.category.kind).collect();
        assert_eq!(
            kinds,
            vec![
                "missing_semicolon",
                "missing_parenthesis",
                "deprecated_symbol",
                "missing_function"
            ]
        );
    }

    #[test]
    fn test_known_symbols() {
        assert!(is_known_symbol("ontick"));
        assert!(is_known_symbol("op_buy"));
        assert!(!is_known_symbol("ticket123"));
    }
}
