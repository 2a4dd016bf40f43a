//! The heuristic scorer: the last local, free and deterministic tier before the generative model.
//!
//! Patterns are checked in a fixed priority order and the first hit wins:
//!
//! 1. internal transfer and payment patterns
//! 2. the owner's contacts (tenants and vendors)
//! 3. the vendor keyword table
//! 4. the personal-expense keyword table
//! 5. the aggregator's own category, when it sent one
//! 6. the `Needs Review` bucket, with low confidence

use crate::model::{normalize_text, CategoryLabel, ContactKind, UserContext, L0};
use rust_decimal::Decimal;

/// Confidence reported with the default bucket.
pub const DEFAULT_CONFIDENCE: f64 = 0.1;

/// A heuristic guess.
#[derive(Debug, Clone, PartialEq)]
pub struct Scored {
    pub label: CategoryLabel,
    /// Between 0 and 1.
    pub confidence: f64,
    /// A short note on which pattern produced the guess.
    pub reason: String,
}

impl Scored {
    fn new(label: CategoryLabel, confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            label,
            confidence,
            reason: reason.into(),
        }
    }

    /// True when nothing matched and this is the `Needs Review` bucket.
    pub fn is_default(&self) -> bool {
        self.label.is_needs_review()
    }
}

#[derive(Debug, Clone, Copy)]
enum Movement {
    Transfer,
    CardPayment,
    Mortgage,
    Loan,
}

impl Movement {
    fn label(self) -> CategoryLabel {
        match self {
            Movement::Transfer => {
                CategoryLabel::new(L0::Asset, "Assets", "Transfers", "Internal Transfer")
            }
            Movement::CardPayment => {
                CategoryLabel::new(L0::Liability, "Liabilities", "Credit Card Payments", "")
            }
            Movement::Mortgage => {
                CategoryLabel::new(L0::Liability, "Liabilities", "Mortgage Payments", "")
            }
            Movement::Loan => CategoryLabel::new(L0::Liability, "Liabilities", "Loan Payments", ""),
        }
    }
}

const MOVEMENT_PATTERNS: &[(&str, Movement)] = &[
    ("ONLINE TRANSFER", Movement::Transfer),
    ("INTERNAL TRANSFER", Movement::Transfer),
    ("TRANSFER TO", Movement::Transfer),
    ("TRANSFER FROM", Movement::Transfer),
    ("XFER", Movement::Transfer),
    ("CREDIT CARD PAYMENT", Movement::CardPayment),
    ("CARD PAYMENT", Movement::CardPayment),
    ("PAYMENT THANK YOU", Movement::CardPayment),
    ("AUTOPAY", Movement::CardPayment),
    ("MORTGAGE", Movement::Mortgage),
    ("LOAN PAYMENT", Movement::Loan),
    ("LOAN PMT", Movement::Loan),
];

/// Vendor keyword, then the `l1`, `l2` and `l3` under `OPERATING EXPENSE`.
const VENDORS: &[(&str, &str, &str, &str)] = &[
    ("HOME DEPOT", "Operating Expenses", "Office Expenses", "Supplies"),
    ("OFFICE DEPOT", "Operating Expenses", "Office Expenses", "Supplies"),
    ("STAPLES", "Operating Expenses", "Office Expenses", "Supplies"),
    ("USPS", "Operating Expenses", "Office Expenses", "Postage"),
    ("LOWE'S", "Operating Expenses", "Repairs & Maintenance", "Materials"),
    ("LOWES", "Operating Expenses", "Repairs & Maintenance", "Materials"),
    ("MENARDS", "Operating Expenses", "Repairs & Maintenance", "Materials"),
    ("ACE HARDWARE", "Operating Expenses", "Repairs & Maintenance", "Materials"),
    ("SHERWIN WILLIAMS", "Operating Expenses", "Repairs & Maintenance", "Paint"),
    ("FERGUSON", "Operating Expenses", "Repairs & Maintenance", "Plumbing"),
    ("GRAINGER", "Operating Expenses", "Repairs & Maintenance", "Materials"),
    ("LANDSCAPING", "Operating Expenses", "Repairs & Maintenance", "Landscaping"),
    ("PLUMBING", "Operating Expenses", "Repairs & Maintenance", "Plumbing"),
    ("HVAC", "Operating Expenses", "Repairs & Maintenance", "HVAC"),
    ("CLEANING", "Operating Expenses", "Cleaning", ""),
    ("LEGALZOOM", "Operating Expenses", "Legal & Professional", ""),
    ("ATTORNEY", "Operating Expenses", "Legal & Professional", ""),
    ("CPA", "Operating Expenses", "Legal & Professional", "Accounting"),
];

const PERSONAL: &[&str] = &[
    "NETFLIX",
    "SPOTIFY",
    "HULU",
    "STARBUCKS",
    "DOORDASH",
    "UBER EATS",
    "GRUBHUB",
    "WHOLE FOODS",
    "TRADER JOE",
    "SAFEWAY",
    "KROGER",
    "CHIPOTLE",
    "MCDONALD",
    "AMC THEATRES",
    "SEPHORA",
];

fn owners_draw() -> CategoryLabel {
    CategoryLabel::new(L0::Equity, "Owner's Equity", "Owner's Draw", "Personal")
}

fn rent() -> CategoryLabel {
    CategoryLabel::new(L0::Income, "Rental Income", "Rent", "")
}

/// Scores a transaction. Never fails: total ambiguity yields the `Needs Review` bucket with
/// `DEFAULT_CONFIDENCE`.
pub fn score(
    description: &str,
    amount: Decimal,
    raw_category: Option<&str>,
    context: &UserContext,
) -> Scored {
    let text = normalize_text(description);

    if !text.is_empty() {
        if let Some((pattern, movement)) = MOVEMENT_PATTERNS
            .iter()
            .find(|(pattern, _)| contains_word(&text, pattern))
        {
            return Scored::new(movement.label(), 0.9, format!("matched payment pattern '{pattern}'"));
        }

        if let Some(scored) = score_contacts(&text, amount, context) {
            return scored;
        }

        if let Some((vendor, l1, l2, l3)) = VENDORS
            .iter()
            .find(|(vendor, ..)| contains_word(&text, vendor))
        {
            return Scored::new(
                CategoryLabel::new(L0::OperatingExpense, *l1, *l2, *l3),
                0.8,
                format!("matched vendor keyword '{vendor}'"),
            );
        }

        if let Some(keyword) = PERSONAL.iter().find(|k| contains_word(&text, k)) {
            return Scored::new(
                owners_draw(),
                0.6,
                format!("matched personal expense keyword '{keyword}'"),
            );
        }
    }

    if let Some(scored) = raw_category.and_then(|raw| score_raw_category(raw, amount)) {
        return scored;
    }

    Scored::new(
        CategoryLabel::needs_review(),
        DEFAULT_CONFIDENCE,
        "no heuristic pattern matched",
    )
}

fn score_contacts(text: &str, amount: Decimal, context: &UserContext) -> Option<Scored> {
    for contact in &context.contacts {
        let name = normalize_text(&contact.name);
        if name.is_empty() || !contains_word(text, &name) {
            continue;
        }
        match contact.kind {
            ContactKind::Tenant if amount > Decimal::ZERO => {
                return Some(Scored::new(
                    rent(),
                    0.9,
                    format!("payment from tenant '{}'", contact.name),
                ));
            }
            ContactKind::Vendor => {
                if let Some(label) = &contact.default_category {
                    return Some(Scored::new(
                        label.normalized(amount),
                        0.85,
                        format!("payment to vendor '{}'", contact.name),
                    ));
                }
            }
            ContactKind::Tenant => {}
        }
    }
    None
}

/// Maps the aggregator's category onto the taxonomy. Aggregators send values such as
/// `RENT_AND_UTILITIES` or `Home Improvement`.
fn score_raw_category(raw: &str, amount: Decimal) -> Option<Scored> {
    let raw_lower = raw.to_lowercase().replace(['_', '-'], " ");
    let raw_lower = raw_lower.trim();
    if raw_lower.is_empty() {
        return None;
    }
    let opex = |l2: &str, l3: &str| CategoryLabel::new(L0::OperatingExpense, "Operating Expenses", l2, l3);

    let label = if raw_lower.starts_with("transfer") {
        Movement::Transfer.label()
    } else if raw_lower.contains("loan") || raw_lower.contains("mortgage") {
        Movement::Loan.label()
    } else if raw_lower.contains("credit card") {
        Movement::CardPayment.label()
    } else if raw_lower.contains("utilities") {
        opex("Utilities", "")
    } else if raw_lower.contains("insurance") {
        opex("Insurance", "")
    } else if raw_lower.contains("tax") {
        opex("Taxes", "")
    } else if raw_lower.contains("home improvement") || raw_lower.contains("hardware") {
        opex("Repairs & Maintenance", "")
    } else if raw_lower.contains("bank fees") || raw_lower.contains("service charge") {
        opex("Bank Fees", "")
    } else if raw_lower.contains("office") {
        opex("Office Expenses", "")
    } else if raw_lower.starts_with("income") || raw_lower.contains("deposit") {
        if amount > Decimal::ZERO {
            CategoryLabel::new(L0::Income, "Other Income", "", "")
        } else {
            return None;
        }
    } else if ["food and drink", "restaurant", "entertainment", "personal care", "groceries"]
        .iter()
        .any(|p| raw_lower.contains(p))
    {
        owners_draw()
    } else {
        return None;
    };
    Some(Scored::new(label, 0.5, format!("aggregator category '{raw}'")))
}

/// True when `needle` occurs in `haystack` bounded by non-alphanumeric characters or the ends of
/// the string. Both arguments are expected in normalized (uppercase) form.
fn contains_word(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let is_word = |c: Option<char>| c.is_some_and(|c| c.is_alphanumeric());
    haystack.match_indices(needle).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + needle.len()..].chars().next();
        !is_word(before) && !is_word(after)
    })
}
