//! Realistic-text catalogue behind the dotted operator names.
//!
//! Operators like `%name.firstName` or `%address.city` resolve to a
//! catalogue entry at compile time. The catalogue is a small built-in word
//! bank; an operator with no entry degrades to echoing its own name.

use bson::Bson;
use rand::rngs::StdRng;
use rand::Rng;

/// Compile-time resolved producer for a catalogue operator.
pub type TextFn = fn(&mut StdRng) -> Bson;

const FIRST_NAMES: &[&str] = &[
    "James", "Mary", "Robert", "Patricia", "John", "Jennifer", "Michael", "Linda", "David",
    "Elizabeth", "William", "Barbara", "Richard", "Susan", "Joseph", "Jessica", "Thomas",
    "Sarah", "Charles", "Karen", "Pierre", "Marie", "Jean", "Sophie", "Luc", "Emma", "Hugo",
    "Chloe", "Louis", "Camille",
];

const LAST_NAMES: &[&str] = &[
    "Smith", "Johnson", "Williams", "Brown", "Jones", "Garcia", "Miller", "Davis", "Rodriguez",
    "Martinez", "Martin", "Bernard", "Dubois", "Thomas", "Robert", "Richard", "Petit", "Durand",
    "Leroy", "Moreau", "Schmidt", "Mueller", "Fischer", "Weber", "Meyer", "Tanaka", "Suzuki",
    "Sato", "Silva", "Santos",
];

const CITIES: &[&str] = &[
    "Paris", "London", "Berlin", "Madrid", "Rome", "Vienna", "Amsterdam", "Brussels", "Lisbon",
    "Dublin", "New York", "Chicago", "Boston", "Seattle", "Denver", "Tokyo", "Osaka", "Sydney",
    "Toronto", "Sao Paulo",
];

const COUNTRIES: &[&str] = &[
    "France", "United States", "United Kingdom", "Germany", "Japan", "Australia", "Brazil",
    "India", "Canada", "Spain", "Italy", "Netherlands",
];

const STREET_SUFFIXES: &[&str] = &["Street", "Avenue", "Boulevard", "Lane", "Road", "Place"];

const STREET_NAMES: &[&str] = &[
    "Oak", "Maple", "Cedar", "Elm", "Pine", "Main", "Church", "High", "Park", "Mill", "River",
    "Lake", "Hill", "Garden", "Station",
];

const COMPANY_SUFFIXES: &[&str] = &["Inc", "LLC", "Group", "Ltd", "and Sons", "Partners"];

const DOMAINS: &[&str] = &[
    "example.com",
    "example.org",
    "example.net",
    "mail.example.com",
];

const WORDS: &[&str] = &[
    "lorem", "ipsum", "dolor", "sit", "amet", "consectetur", "adipiscing", "elit", "sed", "do",
    "eiusmod", "tempor", "incididunt", "labore", "dolore", "magna", "aliqua", "enim", "minim",
    "veniam", "quis", "nostrud", "exercitation", "ullamco", "laboris", "nisi", "aliquip",
    "commodo", "consequat", "duis", "aute", "irure", "reprehenderit", "voluptate", "velit",
    "esse", "cillum", "fugiat", "nulla", "pariatur",
];

fn pick(rng: &mut StdRng, words: &[&'static str]) -> &'static str {
    words[rng.random_range(0..words.len())]
}

fn first_name(rng: &mut StdRng) -> Bson {
    Bson::String(pick(rng, FIRST_NAMES).to_string())
}

fn last_name(rng: &mut StdRng) -> Bson {
    Bson::String(pick(rng, LAST_NAMES).to_string())
}

fn full_name(rng: &mut StdRng) -> Bson {
    Bson::String(format!(
        "{} {}",
        pick(rng, FIRST_NAMES),
        pick(rng, LAST_NAMES)
    ))
}

fn city(rng: &mut StdRng) -> Bson {
    Bson::String(pick(rng, CITIES).to_string())
}

fn country(rng: &mut StdRng) -> Bson {
    Bson::String(pick(rng, COUNTRIES).to_string())
}

fn street_address(rng: &mut StdRng) -> Bson {
    Bson::String(format!(
        "{} {} {}",
        rng.random_range(1..2000),
        pick(rng, STREET_NAMES),
        pick(rng, STREET_SUFFIXES)
    ))
}

fn company_name(rng: &mut StdRng) -> Bson {
    Bson::String(format!(
        "{} {}",
        pick(rng, LAST_NAMES),
        pick(rng, COMPANY_SUFFIXES)
    ))
}

fn email_address(rng: &mut StdRng) -> Bson {
    Bson::String(format!(
        "{}.{}@{}",
        pick(rng, FIRST_NAMES).to_lowercase(),
        pick(rng, LAST_NAMES).to_lowercase(),
        pick(rng, DOMAINS)
    ))
}

fn url(rng: &mut StdRng) -> Bson {
    Bson::String(format!(
        "https://www.{}.{}",
        pick(rng, LAST_NAMES).to_lowercase(),
        pick(rng, DOMAINS)
    ))
}

fn word(rng: &mut StdRng) -> Bson {
    Bson::String(pick(rng, WORDS).to_string())
}

fn sentence(rng: &mut StdRng) -> Bson {
    let count = rng.random_range(4..12);
    let words: Vec<&str> = (0..count).map(|_| pick(rng, WORDS)).collect();
    let mut joined = words.join(" ");
    if let Some(first) = joined.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    joined.push('.');
    Bson::String(joined)
}

fn paragraph(rng: &mut StdRng) -> Bson {
    let count = rng.random_range(3..6);
    let sentences: Vec<String> = (0..count)
        .map(|_| match sentence(rng) {
            Bson::String(s) => s,
            _ => String::new(),
        })
        .collect();
    Bson::String(sentences.join(" "))
}

/// Resolve a dotted operator name to a catalogue producer.
pub fn bridge(operator: &str) -> Option<TextFn> {
    let name = operator.strip_prefix('%')?;
    let mut parts = name.split('.');
    let category = parts.next()?;
    let key = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    match (category, key) {
        ("name", "firstName") => Some(first_name),
        ("name", "lastName") => Some(last_name),
        ("name", "fullName") | ("name", "name") => Some(full_name),
        ("address", "city") => Some(city),
        ("address", "country") => Some(country),
        ("address", "streetAddress") => Some(street_address),
        ("company", "name") => Some(company_name),
        ("internet", "emailAddress") => Some(email_address),
        ("internet", "url") => Some(url),
        ("lorem", "word") => Some(word),
        ("lorem", "sentence") => Some(sentence),
        ("lorem", "paragraph") => Some(paragraph),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_bridge_resolves_known_entries() {
        assert!(bridge("%name.firstName").is_some());
        assert!(bridge("%lorem.sentence").is_some());
        assert!(bridge("%internet.emailAddress").is_some());
    }

    #[test]
    fn test_bridge_rejects_unknown_shapes() {
        assert!(bridge("%name").is_none());
        assert!(bridge("%name.firstName.extra").is_none());
        assert!(bridge("%frob.nicate").is_none());
    }

    #[test]
    fn test_email_shape() {
        let mut rng = StdRng::seed_from_u64(3);
        let Bson::String(email) = email_address(&mut rng) else {
            panic!("expected a string");
        };
        assert!(email.contains('@'));
        assert_eq!(email, email.to_lowercase());
    }

    #[test]
    fn test_sentence_is_capitalized_and_terminated() {
        let mut rng = StdRng::seed_from_u64(5);
        let Bson::String(s) = sentence(&mut rng) else {
            panic!("expected a string");
        };
        assert!(s.ends_with('.'));
        assert!(s.chars().next().unwrap().is_ascii_uppercase());
    }
}
