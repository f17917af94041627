//! Free-text research-field classification into a fixed discipline taxonomy.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::FieldInput;

pub const CATCH_ALL: &str = "N/A";

/// Shortest field token matched as an abbreviation of a longer keyword ("bio", "chem").
const MIN_FIELD_ABBREVIATION: usize = 3;
/// Title and description words need more context before they count as abbreviations.
const MIN_PROSE_ABBREVIATION: usize = 5;

/// Label used when no token matches any category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FallbackCategory {
    #[default]
    #[serde(rename = "N/A", alias = "n/a", alias = "NA")]
    NotApplicable,
    #[serde(rename = "STEM", alias = "stem")]
    Stem,
}

impl FallbackCategory {
    pub fn label(&self) -> &'static str {
        match self {
            FallbackCategory::NotApplicable => CATCH_ALL,
            FallbackCategory::Stem => "STEM",
        }
    }
}

const BUILTIN_CATEGORIES: &[(&str, &[&str])] = &[
    (
        "Biology",
        &[
            "biology", "biological", "bioscience", "life science", "molecular biology",
            "cell biology", "genetics", "genomics", "genome", "ecology", "ecological",
            "evolution", "microbiology", "microbe", "neuroscience", "neurobiology",
            "physiology", "zoology", "botany", "plant science", "marine biology",
            "immunology", "biomedical", "biomedicine", "bioinformatics",
            "computational biology", "biotechnology", "organism", "ecosystem", "wildlife",
            "conservation biology", "entomology", "developmental biology", "cancer",
            "medicine", "medical", "health science", "pharmacology", "toxicology",
            "virology", "anatomy", "protein", "stem cell", "animal", "mycology",
            "ornithology", "fisheries", "biodiversity", "epidemiology", "pathology",
            "agriculture", "agricultural", "agronomy", "horticulture", "food science", "crops",
            "crop science", "plant pathology",
        ],
    ),
    (
        "Chemistry",
        &[
            "chemistry", "chemical", "biochemistry", "organic chemistry", "inorganic",
            "analytical chemistry", "physical chemistry", "polymer", "catalysis",
            "synthesis", "spectroscopy", "electrochemistry", "chemical biology",
            "molecular", "nanochemistry", "photochemistry", "medicinal chemistry",
            "crystallography", "pharmaceutical", "chromatography", "green chemistry",
        ],
    ),
    (
        "Physics",
        &[
            "physics", "physical science", "astrophysics", "astronomy", "cosmology",
            "quantum", "optics", "photonics", "particle", "nuclear", "condensed matter",
            "plasma", "relativity", "astrophysical", "laser", "acoustics",
            "thermodynamics", "electromagnetism", "gravitational", "space science",
            "biophysics", "high energy", "superconductivity",
        ],
    ),
    (
        "Engineering",
        &[
            "engineering", "engineer", "mechanical", "electrical", "aerospace",
            "materials science", "materials", "robotics", "manufacturing",
            "nanotechnology", "structural", "electronics", "circuit", "energy systems",
            "renewable energy", "semiconductor", "mechatronics", "aeronautics",
            "automotive", "hydraulics", "transportation", "infrastructure", "microfluidics",
        ],
    ),
    (
        "Computer Science",
        &[
            "computer science", "computing", "computation", "computational", "software",
            "programming", "algorithm", "artificial intelligence", "machine learning",
            "deep learning", "data science", "cybersecurity", "networking", "database",
            "human-computer interaction", "informatics", "information technology",
            "information science", "high performance computing", "cloud", "coding",
            "computer", "data analytics", "natural language processing",
            "computer vision", "distributed systems", "blockchain",
        ],
    ),
    (
        "Mathematics",
        &[
            "mathematics", "mathematical", "math", "statistics", "statistical",
            "applied math", "algebra", "geometry", "topology", "calculus", "probability",
            "number theory", "combinatorics", "operations research", "actuarial",
            "numerical", "differential equations", "optimization",
        ],
    ),
    (
        "Earth Science",
        &[
            "earth science", "earth", "geology", "geoscience", "geophysics", "geography",
            "oceanography", "ocean", "marine science", "atmospheric", "meteorology",
            "climate", "climatology", "hydrology", "environmental science",
            "environment", "seismology", "volcanology", "glaciology", "soil science",
            "planetary", "remote sensing", "geochemistry", "sustainability",
            "natural resources", "water resources", "weather", "polar", "coastal",
            "limnology", "paleontology", "mineralogy",
        ],
    ),
    (
        "Social Science",
        &[
            "social science", "psychology", "sociology", "economics", "anthropology",
            "political science", "linguistics", "cognitive science", "behavioral",
            "education", "public policy", "history", "communication", "criminology",
            "public health", "urban planning", "archaeology", "human development",
            "social work", "demography", "philosophy", "policy",
        ],
    ),
    (
        "STEM",
        &[
            "stem", "science", "sciences", "technology", "interdisciplinary",
            "multidisciplinary", "natural science", "stem fields",
        ],
    ),
];

const BUILTIN_EXCLUSIONS: &[&str] = &[
    "summer", "paid", "sponsored", "reu", "reus", "program", "programs", "programme",
    "research", "researcher", "researchers", "undergraduate", "undergraduates",
    "graduate", "student", "students", "university", "college", "institute",
    "institution", "opportunity", "opportunities", "internship", "internships",
    "fellowship", "the", "and", "for", "with", "from", "this", "that", "will", "are",
    "our", "you", "your", "have", "has", "all", "into", "their", "who", "can", "also",
    "more", "other", "such", "including", "freshman", "freshmen", "sophomore",
    "sophomores", "junior", "juniors", "senior", "seniors", "year", "years", "week",
    "weeks", "stipend", "housing", "deadline", "apply", "application", "applications",
    "online", "person", "in-person", "virtual", "remote", "national", "foundation",
    "nsf", "site", "sites", "center", "department", "school", "lab", "labs",
    "laboratory", "faculty", "mentor", "mentors", "mentoring", "experience",
    "experiences", "project", "projects", "participants", "participant", "session",
    "hands-on", "training", "skills", "work", "working", "field", "fields", "area",
    "areas", "various", "new", "current", "provide", "provides", "offered",
    "available", "eligible", "eligibility", "citizens", "residents", "required",
    "must", "about", "information", "details", "visit", "website", "contact", "email",
    "travel", "meals", "hours", "full-time", "part-time", "level", "academic",
    "career", "professional", "development",
];

static FIELD_SPLIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*(?:[,;&]|\band\b)\s*").expect("valid field split regex"));
static NUMERIC_LIKE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:\d+(?:st|nd|rd|th)?|\d{4}(?:[-/]\d{2,4})?|[\d$,./%:\-]+)$")
        .expect("valid numeric token regex")
});

static BUILTIN: Lazy<FieldTaxonomy> = Lazy::new(FieldTaxonomy::builtin);

#[derive(Debug, Error)]
pub enum TaxonomyError {
    #[error("parsing taxonomy rules: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("taxonomy must declare at least one category")]
    NoCategories,
    #[error("taxonomy category {0} has no keywords")]
    EmptyCategory(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryRule {
    pub name: String,
    pub keywords: Vec<String>,
}

/// Keyword-to-category table plus the filler words that never classify.
#[derive(Debug, Clone)]
pub struct FieldTaxonomy {
    categories: Vec<CategoryRule>,
    exclusions: HashSet<String>,
}

#[derive(Debug, Deserialize)]
struct TaxonomyFile {
    categories: Vec<TaxonomyFileCategory>,
    #[serde(default)]
    exclusions: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TaxonomyFileCategory {
    name: String,
    keywords: Vec<String>,
}

impl Default for FieldTaxonomy {
    fn default() -> Self {
        BUILTIN.clone()
    }
}

impl FieldTaxonomy {
    pub fn builtin() -> Self {
        Self {
            categories: BUILTIN_CATEGORIES
                .iter()
                .map(|(name, keywords)| CategoryRule {
                    name: (*name).to_string(),
                    keywords: keywords.iter().map(|k| (*k).to_string()).collect(),
                })
                .collect(),
            exclusions: BUILTIN_EXCLUSIONS.iter().map(|w| (*w).to_string()).collect(),
        }
    }

    /// Load a replacement table. Omitted `exclusions` keep the built-in list.
    pub fn from_yaml_str(text: &str) -> Result<Self, TaxonomyError> {
        let file: TaxonomyFile = serde_yaml::from_str(text)?;
        if file.categories.is_empty() {
            return Err(TaxonomyError::NoCategories);
        }
        let mut categories = Vec::with_capacity(file.categories.len());
        for category in file.categories {
            let keywords = category
                .keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect::<Vec<_>>();
            if keywords.is_empty() {
                return Err(TaxonomyError::EmptyCategory(category.name));
            }
            categories.push(CategoryRule {
                name: category.name.trim().to_string(),
                keywords,
            });
        }
        let exclusions = match file.exclusions {
            Some(words) => words.iter().map(|w| w.trim().to_lowercase()).collect(),
            None => BUILTIN_EXCLUSIONS.iter().map(|w| (*w).to_string()).collect(),
        };
        Ok(Self {
            categories,
            exclusions,
        })
    }

    pub fn categories(&self) -> &[CategoryRule] {
        &self.categories
    }

    pub fn category_names(&self) -> impl Iterator<Item = &str> {
        self.categories.iter().map(|c| c.name.as_str())
    }

    /// Classify field text plus title/description words into canonical category names.
    ///
    /// The result is deduplicated, ordered by category declaration order, and never empty.
    pub fn standardize(
        &self,
        input: &FieldInput,
        description: Option<&str>,
        title: Option<&str>,
        fallback: FallbackCategory,
    ) -> Vec<String> {
        let mut hits = vec![false; self.categories.len()];

        let pool = candidate_tokens(input)
            .into_iter()
            .map(|token| (token, MIN_FIELD_ABBREVIATION))
            .chain(prose_words(title).into_iter().map(|word| (word, MIN_PROSE_ABBREVIATION)))
            .chain(prose_words(description).into_iter().map(|word| (word, MIN_PROSE_ABBREVIATION)));

        for (token, min_abbreviation) in pool {
            let token = token.to_lowercase();
            if token.is_empty() || self.is_excluded(&token) {
                continue;
            }
            if let Some(idx) = self.classify_token(&token, min_abbreviation) {
                hits[idx] = true;
            }
        }

        let out = self
            .categories
            .iter()
            .zip(hits)
            .filter(|(_, hit)| *hit)
            .map(|(c, _)| c.name.clone())
            .collect::<Vec<_>>();

        if out.is_empty() {
            vec![fallback.label().to_string()]
        } else {
            out
        }
    }

    fn is_excluded(&self, token: &str) -> bool {
        self.exclusions.contains(token) || NUMERIC_LIKE.is_match(token)
    }

    /// First category with a keyword inside the token. Failing that across every category,
    /// the first category with a keyword containing the token, if the token is long enough.
    fn classify_token(&self, token: &str, min_abbreviation: usize) -> Option<usize> {
        let direct = self
            .categories
            .iter()
            .position(|category| category.keywords.iter().any(|kw| token.contains(kw.as_str())));
        if direct.is_some() || token.chars().count() < min_abbreviation {
            return direct;
        }
        self.categories
            .iter()
            .position(|category| category.keywords.iter().any(|kw| kw.contains(token)))
    }
}

/// Standardize with the built-in taxonomy and the `N/A` fallback.
pub fn standardize(input: &FieldInput, description: Option<&str>, title: Option<&str>) -> Vec<String> {
    BUILTIN.standardize(input, description, title, FallbackCategory::NotApplicable)
}

fn candidate_tokens(input: &FieldInput) -> Vec<String> {
    match input {
        FieldInput::Text(text) => FIELD_SPLIT
            .split(text)
            .map(|s| trim_token(s).to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        FieldInput::List(items) => items
            .iter()
            .map(|s| trim_token(s).to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    }
}

fn prose_words(text: Option<&str>) -> Vec<String> {
    text.unwrap_or_default()
        .split_whitespace()
        .map(trim_token)
        .filter(|w| w.chars().count() > 2)
        .map(ToString::to_string)
        .collect()
}

fn trim_token(s: &str) -> &str {
    s.trim_matches(|c: char| !c.is_alphanumeric() && c != '$' && c != '%')
}
