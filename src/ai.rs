use anyhow::{Context, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::env;
use std::sync::LazyLock;

use crate::config::{ANALYSIS_DESCRIPTION_CHARS, EMAIL_DESCRIPTION_CHARS};
use crate::error::{AppError, Result};
use crate::models::{Company, Job, JobAnalysis};

// --- Provider trait ---

/// One model call. `schema` asks for structured JSON output; providers that
/// cannot enforce it fold it into the prompt.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub schema: Option<Value>,
    pub temperature: Option<f32>,
    pub web_search: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: String,
    /// Web pages the answer was grounded on, in first-seen order.
    pub sources: Vec<String>,
}

pub trait AIProvider: Send + Sync {
    fn complete(&self, request: &CompletionRequest) -> Result<Completion>;
    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderKind {
    Gemini,
    Anthropic,
    OpenAI,
}

#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub provider: ProviderKind,
    pub model_id: String,
    pub short_name: String,
}

pub fn resolve_model(name: &str) -> anyhow::Result<ModelSpec> {
    let (provider, model_id, short_name) = match name {
        // Google Gemini (requires GEMINI_API_KEY)
        "gemini-flash" | "gemini-2.5-flash" => (ProviderKind::Gemini, "gemini-2.5-flash", "gemini-flash"),
        "gemini-pro" | "gemini-2.5-pro" => (ProviderKind::Gemini, "gemini-2.5-pro", "gemini-pro"),
        // Direct Anthropic API (requires ANTHROPIC_API_KEY)
        "api-sonnet" => (ProviderKind::Anthropic, "claude-sonnet-4-5-20250929", "api-sonnet"),
        "api-haiku" => (ProviderKind::Anthropic, "claude-haiku-4-5-20251001", "api-haiku"),
        // OpenAI (requires OPENAI_API_KEY)
        "gpt-4o" => (ProviderKind::OpenAI, "gpt-4o", "gpt-4o"),
        _ => {
            return Err(anyhow!(
                "Unknown model '{}'. Available: gemini-flash (default), gemini-pro, \
                 api-sonnet, api-haiku, gpt-4o",
                name
            ));
        }
    };
    Ok(ModelSpec {
        provider,
        model_id: model_id.to_string(),
        short_name: short_name.to_string(),
    })
}

pub fn create_provider(spec: &ModelSpec) -> anyhow::Result<Box<dyn AIProvider>> {
    match spec.provider {
        ProviderKind::Gemini => Ok(Box::new(GeminiProvider::new(spec.model_id.clone())?)),
        ProviderKind::Anthropic => Ok(Box::new(AnthropicProvider::new(spec.model_id.clone())?)),
        ProviderKind::OpenAI => Ok(Box::new(OpenAIProvider::new(spec.model_id.clone())?)),
    }
}

fn upstream_failure(provider: &str, response: reqwest::blocking::Response) -> AppError {
    let status = response.status();
    let error_text = response.text().unwrap_or_default();
    AppError::Upstream(format!(
        "{provider} API request failed with status {status}: {error_text}"
    ))
}

/// Prompt text for providers without native schema support.
fn prompt_with_schema(request: &CompletionRequest) -> String {
    match &request.schema {
        Some(schema) => format!(
            "{}\n\nRespond with a single JSON object matching this schema and nothing else:\n{}",
            request.prompt, schema
        ),
        None => request.prompt.clone(),
    }
}

// --- Gemini provider ---

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Deserialize)]
struct GroundingChunk {
    web: Option<WebSource>,
}

#[derive(Debug, Deserialize)]
struct WebSource {
    uri: Option<String>,
}

impl GeminiResponse {
    fn into_completion(self) -> Completion {
        let Some(candidate) = self.candidates.into_iter().next() else {
            return Completion::default();
        };

        let text = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect::<String>())
            .unwrap_or_default();

        let mut sources: Vec<String> = Vec::new();
        let uris = candidate
            .grounding_metadata
            .into_iter()
            .flat_map(|m| m.grounding_chunks)
            .filter_map(|chunk| chunk.web.and_then(|w| w.uri));
        for uri in uris {
            if !sources.contains(&uri) {
                sources.push(uri);
            }
        }

        Completion { text, sources }
    }
}

#[derive(Debug)]
pub struct GeminiProvider {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl GeminiProvider {
    pub fn new(model_id: String) -> anyhow::Result<Self> {
        let api_key = env::var("GEMINI_API_KEY")
            .context("GEMINI_API_KEY environment variable not set. Set it with: export GEMINI_API_KEY=your-key-here")?;
        let client = reqwest::blocking::Client::new();
        Ok(Self { api_key, model_id, client })
    }

    fn request_body(request: &CompletionRequest) -> Value {
        let mut body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": request.prompt }] }],
        });

        if let Some(system) = &request.system {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }

        let mut generation = Map::new();
        if let Some(temperature) = request.temperature {
            generation.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(schema) = &request.schema {
            generation.insert("responseMimeType".to_string(), json!("application/json"));
            generation.insert("responseSchema".to_string(), schema.clone());
        }
        if !generation.is_empty() {
            body["generationConfig"] = Value::Object(generation);
        }

        if request.web_search {
            body["tools"] = json!([{ "google_search": {} }]);
        }
        body
    }
}

impl AIProvider for GeminiProvider {
    fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let url = format!("{}/{}:generateContent", GEMINI_API_BASE, self.model_id);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&Self::request_body(request))
            .send()?;

        if !response.status().is_success() {
            return Err(upstream_failure("Gemini", response));
        }

        let api_response: GeminiResponse = response.json()?;
        Ok(api_response.into_completion())
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- Anthropic provider ---

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug)]
pub struct AnthropicProvider {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl AnthropicProvider {
    pub fn new(model_id: String) -> anyhow::Result<Self> {
        let api_key = env::var("ANTHROPIC_API_KEY")
            .context("ANTHROPIC_API_KEY environment variable not set. Set it with: export ANTHROPIC_API_KEY=your-key-here")?;
        let client = reqwest::blocking::Client::new();
        Ok(Self { api_key, model_id, client })
    }
}

impl AIProvider for AnthropicProvider {
    fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        if request.web_search {
            tracing::debug!(model = %self.model_id, "web search not available, answering from model knowledge");
        }

        let body = AnthropicRequest {
            model: self.model_id.clone(),
            max_tokens: 4096,
            system: request.system.clone(),
            temperature: request.temperature,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt_with_schema(request),
            }],
        };

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()?;

        if !response.status().is_success() {
            return Err(upstream_failure("Anthropic", response));
        }

        let api_response: AnthropicResponse = response.json()?;
        let text = api_response
            .content
            .first()
            .map(|block| block.text.clone())
            .ok_or_else(|| AppError::Upstream("No content in Anthropic API response".to_string()))?;
        Ok(Completion { text, sources: Vec::new() })
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- OpenAI provider ---

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug)]
pub struct OpenAIProvider {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl OpenAIProvider {
    pub fn new(model_id: String) -> anyhow::Result<Self> {
        let api_key = env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY environment variable not set. Set it with: export OPENAI_API_KEY=your-key-here")?;
        let client = reqwest::blocking::Client::new();
        Ok(Self { api_key, model_id, client })
    }
}

impl AIProvider for OpenAIProvider {
    fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        if request.web_search {
            tracing::debug!(model = %self.model_id, "web search not available, answering from model knowledge");
        }

        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: prompt_with_schema(request),
        });

        let body = OpenAIRequest {
            model: self.model_id.clone(),
            messages,
            temperature: request.temperature,
            response_format: request
                .schema
                .as_ref()
                .map(|_| json!({ "type": "json_object" })),
        };

        let response = self
            .client
            .post(OPENAI_API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()?;

        if !response.status().is_success() {
            return Err(upstream_failure("OpenAI", response));
        }

        let api_response: OpenAIResponse = response.json()?;
        let text = api_response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| AppError::Upstream("No choices in OpenAI API response".to_string()))?;
        Ok(Completion { text, sources: Vec::new() })
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- Outreach operations ---

/// The agency profile from the settings document, as used in prompts.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgencyProfile {
    #[serde(default)]
    pub company_name: String,
    #[serde(default)]
    pub company_description: String,
    #[serde(default)]
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailDraft {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EmailLookup {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub sources: Vec<String>,
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|s| format!("- {s}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn string_schema() -> Value {
    json!({ "type": "STRING" })
}

fn string_array_schema() -> Value {
    json!({ "type": "ARRAY", "items": { "type": "STRING" } })
}

fn email_draft_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": { "subject": string_schema(), "body": string_schema() },
        "required": ["subject", "body"]
    })
}

/// Strip markdown fences and keep the span from the first `{` to the last
/// `}`. `None` when what is left is not JSON.
pub fn clean_and_parse_json(text: &str) -> Option<Value> {
    let mut clean = text.replace("```json", "").replace("```", "");
    if let (Some(start), Some(end)) = (clean.find('{'), clean.rfind('}')) {
        if start < end {
            clean = clean[start..=end].to_string();
        }
    }
    match serde_json::from_str(&clean) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(error = %e, "model reply is not valid JSON");
            None
        }
    }
}

fn parse_structured<T: serde::de::DeserializeOwned>(completion: &Completion) -> Result<T> {
    let value = clean_and_parse_json(&completion.text)
        .ok_or_else(|| AppError::Upstream("AI response was not valid JSON".to_string()))?;
    Ok(serde_json::from_value(value)?)
}

/// `EMAIL: <token>` line of a lookup reply.
static EMAIL_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)EMAIL:[ \t]*(\S+)").ok());
/// `NAME: <rest of line>` line of a lookup reply.
static NAME_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)NAME:[ \t]*([^\n]+)").ok());

/// First capture of `pattern` in `text`, trimmed. Blank captures count as
/// missing.
fn labelled_value(text: &str, pattern: &Option<Regex>) -> Option<String> {
    let re = pattern.as_ref()?;
    let found = re.captures(text)?.get(1)?.as_str().trim().to_string();
    (!found.is_empty()).then_some(found)
}

pub fn analyze_job(provider: &dyn AIProvider, job: &Job, profile: &AgencyProfile) -> Result<JobAnalysis> {
    let system = format!(
        "You are a Senior Technical Strategist for {}.\nYour Company's Services:\n{}",
        profile.company_name,
        bullet_list(&profile.services)
    );
    let prompt = format!(
        "Job Title: {}\nJob Description: {}\n\
        Analyze this job. Return JSON with score, recommendation, reasoning, painPoints, matchingSkills.",
        job.title,
        truncate_chars(&job.description, ANALYSIS_DESCRIPTION_CHARS)
    );
    let schema = json!({
        "type": "OBJECT",
        "properties": {
            "score": { "type": "NUMBER" },
            "recommendation": { "type": "STRING", "enum": ["CONTACT", "SKIP"] },
            "reasoning": string_schema(),
            "painPoints": string_array_schema(),
            "matchingSkills": string_array_schema()
        },
        "required": ["score", "recommendation", "reasoning", "painPoints", "matchingSkills"]
    });

    let completion = provider.complete(&CompletionRequest {
        system: Some(system),
        prompt,
        schema: Some(schema),
        ..Default::default()
    })?;
    parse_structured(&completion)
}

pub fn generate_email(provider: &dyn AIProvider, job: &Job, profile: &AgencyProfile) -> Result<EmailDraft> {
    let analysis_context = job
        .analysis
        .as_ref()
        .map(|a| format!("Analysis Score: {}/10. Pain Points: {}.", a.score, a.pain_points.join(", ")))
        .unwrap_or_default();
    let matching_skills = match job.analysis.as_ref().map(|a| &a.matching_skills) {
        Some(skills) if !skills.is_empty() => skills.join(", "),
        _ => profile.services.iter().take(3).cloned().collect::<Vec<_>>().join(", "),
    };

    let system = format!(
        "You are a Senior Engineering Partner at {company} with 15 years of experience.\n\
        We specialize in: {services}.\n\n\
        CONTEXT: You are contacting a hiring manager/founder about a specific open role (\"{title}\").\n\n\
        GOAL: Position our team as the immediate solution to the vacancy. Show we can start delivering value faster than a full-time hire.\n\n\
        STRUCTURE:\n\
        1. Hook: \"I saw you're looking for a {title}...\"\n\
        2. The Problem: Acknowledge the specific technical challenge mentioned in their job post.\n\
        3. Our Value (bulleted): List 3 specific ways we hit the ground running using our matching skills.\n\
        4. Soft CTA: \"Open to a brief chat to see if we're a fit?\"\n\n\
        FORMATTING RULES:\n\
        - Use \\n\\n for paragraph breaks.\n\
        - Use \" - \" for bullet points.\n\
        - Keep it under 150 words.",
        company = profile.company_name,
        services = profile.services.join(", "),
        title = job.title,
    );
    let prompt = format!(
        "JOB TITLE: {title}\n\
        COMPANY: {company}\n\
        JOB DESCRIPTION SNIPPET: {snippet}...\n\n\
        ANALYSIS CONTEXT: {analysis_context}\n\
        MATCHING SKILLS: {matching_skills}\n\n\
        Draft a concise, well-formatted email.\n\n\
        SUBJECT LINE: internal style, lowercase. E.g. \"re: {title}\", \"question about {title}\".\n\n\
        Return JSON: {{ \"subject\": \"string\", \"body\": \"string\" }}",
        title = job.title,
        company = job.company_name(),
        snippet = truncate_chars(&job.description, EMAIL_DESCRIPTION_CHARS),
    );

    let completion = provider.complete(&CompletionRequest {
        system: Some(system),
        prompt,
        schema: Some(email_draft_schema()),
        temperature: Some(0.7),
        web_search: false,
    })?;
    parse_structured(&completion)
}

pub fn find_email(provider: &dyn AIProvider, job: &Job) -> Result<EmailLookup> {
    let prompt = format!(
        "Find contact email for {}. Job: {}. Return EMAIL, NAME.",
        job.company_name(),
        job.title
    );
    let completion = provider.complete(&CompletionRequest {
        prompt,
        web_search: true,
        ..Default::default()
    })?;

    let email = labelled_value(&completion.text, &EMAIL_LINE)
        .filter(|e| e.contains('@') && !e.to_lowercase().contains("not found"));
    let name = labelled_value(&completion.text, &NAME_LINE);

    Ok(EmailLookup {
        email,
        name,
        sources: completion.sources,
    })
}

/// Research a company. `None` when the model did not return usable JSON.
pub fn analyze_company(
    provider: &dyn AIProvider,
    company: &Company,
    profile: &AgencyProfile,
) -> Result<Option<Value>> {
    let prompt = format!(
        "Analyze the company \"{name}\" (Website: {website}).\n\n\
        MY COMPANY PROFILE:\n\
        Name: {my_name}\n\
        Description: {my_description}\n\
        Services:\n{services}\n\n\
        Task:\n\
        1. Summarize their business operations (what they do).\n\
        2. Identify 3 potential operational pain points or technical needs based on their industry/website.\n\
        3. Find their social media links (LinkedIn, Twitter, Github, etc).\n\
        4. Select 2-3 of MY SERVICES (from the list above) best suited to solve their pain points.\n\
        5. Recommend a sales approach strategy.\n\n\
        RETURN THE RESULT IN RAW JSON FORMAT ONLY. DO NOT USE MARKDOWN.\n\
        Structure:\n\
        {{\"summary\": \"string\", \"painPoints\": [\"string\"], \
        \"socialLinks\": [{{\"platform\": \"string\", \"url\": \"string\"}}], \
        \"matchingSkills\": [\"string\"], \"recommendedApproach\": \"string\"}}",
        name = company.name,
        website = company.website,
        my_name = profile.company_name,
        my_description = profile.company_description,
        services = bullet_list(&profile.services),
    );

    let completion = provider.complete(&CompletionRequest {
        prompt,
        web_search: true,
        ..Default::default()
    })?;

    let mut analysis = clean_and_parse_json(&completion.text);
    if let Some(Value::Object(map)) = analysis.as_mut() {
        map.insert("sources".to_string(), json!(completion.sources));
    }
    Ok(analysis)
}

pub fn find_decision_maker(provider: &dyn AIProvider, company: &Company) -> Result<Value> {
    let prompt = format!(
        "Find decision makers for \"{name}\" (Website: {website}).\n\
        Looking for up to 3 people in roles like: CTO, Founder, Head of Engineering, Product Manager, or IT Director.\n\
        Also find a general company contact email (like contact@, hello@, jobs@).\n\n\
        Task:\n\
        1. Search for specific people in leadership.\n\
        2. Search for their specific work emails if available.\n\
        3. Search for their LinkedIn profile URLs.\n\
        4. Search for a generic company email.\n\n\
        RETURN THE RESULT IN RAW JSON FORMAT ONLY. DO NOT USE MARKDOWN.\n\
        Structure:\n\
        {{\"contacts\": [{{\"name\": \"string\", \"role\": \"string\", \"email\": \"string\", \"linkedin\": \"string (url)\"}}], \
        \"generalEmail\": \"string\"}}\n\
        If fields are not found, leave them as empty string.",
        name = company.name,
        website = company.website,
    );

    let completion = provider.complete(&CompletionRequest {
        prompt,
        web_search: true,
        ..Default::default()
    })?;

    match clean_and_parse_json(&completion.text) {
        Some(Value::Object(mut map)) => {
            map.insert("decisionMakerSources".to_string(), json!(completion.sources));
            Ok(Value::Object(map))
        }
        _ => Ok(json!({ "contacts": [], "generalEmail": "" })),
    }
}

pub fn generate_company_email(
    provider: &dyn AIProvider,
    company: &Company,
    profile: &AgencyProfile,
    contact_name: Option<&str>,
    contact_role: Option<&str>,
) -> Result<EmailDraft> {
    let contact_name = contact_name.filter(|n| !n.is_empty());
    let recipient_name = contact_name.unwrap_or("Team");
    let recipient_info = match contact_name {
        Some(name) => format!("{} ({})", name, contact_role.unwrap_or_default()),
        None => "Team".to_string(),
    };

    let analysis = company.analysis.as_ref();
    let matching_skills = analysis.map(|a| a.matching_skills.join(", ")).unwrap_or_default();
    let approach = analysis
        .map(|a| a.recommended_approach.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("Consultative problem solving");
    let summary = analysis
        .map(|a| a.summary.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("Unknown");
    let pain_points = analysis
        .map(|a| a.pain_points.join(", "))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "Scaling technical systems".to_string());

    let system = format!(
        "You are a Strategic Account Executive at {my_name}.\n\n\
        ABOUT US: {my_description}\n\
        OUR SERVICES: {services}.\n\n\
        CONTEXT: You are sending a cold email to {company}.\n\n\
        GOAL: Pitch our services as a solution to their challenges using the analysis data.\n\n\
        STRUCTURE:\n\
        1. Subject: intriguing, short, lowercase (e.g. \"thoughts on [topic]\", \"question\").\n\
        2. Greeting: \"Hi {recipient_name},\"\n\
        3. Observation: start with something specific about their company.\n\
        4. Insight: mention the recommended approach: {approach}.\n\
        5. Solution (bullet points): link their pain points to the relevant services. \
        You MUST mention \"{my_name}\" in the body and name the specific services that solve their pain.\n\
        6. The Ask: \"Worth a brief exchange?\"\n\
        7. Signature: \"Best,\\n[Your Name]\"\n\n\
        FORMATTING RULES:\n\
        - Use \\n\\n for paragraph breaks.\n\
        - Use \" - \" for bullet points.\n\
        - Short sentences. No fluff.",
        my_name = profile.company_name,
        my_description = profile.company_description,
        services = profile.services.join(", "),
        company = company.name,
    );
    let prompt = format!(
        "RECIPIENT: {recipient_info}\n\
        COMPANY: {company}\n\
        WEBSITE: {website}\n\n\
        COMPANY SUMMARY: {summary}\n\
        IDENTIFIED PAIN POINTS: {pain_points}\n\
        RELEVANT SERVICES TO PITCH: {matching_skills}\n\
        RECOMMENDED STRATEGY: {approach}\n\n\
        Draft a high-impact, easy-to-read email framed by the recommended strategy.\n\n\
        Output JSON: {{ \"subject\": \"string\", \"body\": \"string\" }}",
        company = company.name,
        website = company.website,
    );

    let completion = provider.complete(&CompletionRequest {
        system: Some(system),
        prompt,
        schema: Some(email_draft_schema()),
        ..Default::default()
    })?;
    parse_structured(&completion)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Returns canned completions and records every request it receives.
    pub(crate) struct StubProvider {
        pub reply: Completion,
        pub requests: Mutex<Vec<CompletionRequest>>,
    }

    impl StubProvider {
        pub(crate) fn new(text: &str, sources: &[&str]) -> Self {
            Self {
                reply: Completion {
                    text: text.to_string(),
                    sources: sources.iter().map(|s| s.to_string()).collect(),
                },
                requests: Mutex::new(Vec::new()),
            }
        }

        fn last_request(&self) -> CompletionRequest {
            self.requests.lock().unwrap().last().cloned().unwrap()
        }
    }

    impl AIProvider for StubProvider {
        fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(self.reply.clone())
        }

        fn model_name(&self) -> &str {
            "stub"
        }
    }

    fn profile() -> AgencyProfile {
        AgencyProfile {
            company_name: "Ferrous Works".to_string(),
            company_description: "Rust consultancy".to_string(),
            services: vec!["Rust".to_string(), "Postgres".to_string(), "Kubernetes".to_string(), "WASM".to_string()],
        }
    }

    fn job() -> Job {
        serde_json::from_value(json!({
            "title": "Backend Engineer",
            "description": "x".repeat(3000),
            "company": { "name": "Acme", "website": "acme.com" }
        }))
        .unwrap()
    }

    fn company() -> Company {
        serde_json::from_value(json!({ "name": "Acme", "website": "https://acme.com" })).unwrap()
    }

    #[test]
    fn test_resolve_model() {
        let spec = resolve_model("gemini-flash").unwrap();
        assert_eq!(spec.model_id, "gemini-2.5-flash");
        assert_eq!(spec.provider, ProviderKind::Gemini);

        let spec = resolve_model("gemini-2.5-flash").unwrap();
        assert_eq!(spec.short_name, "gemini-flash");

        let spec = resolve_model("api-sonnet").unwrap();
        assert_eq!(spec.provider, ProviderKind::Anthropic);

        let spec = resolve_model("gpt-4o").unwrap();
        assert_eq!(spec.provider, ProviderKind::OpenAI);

        assert!(resolve_model("gpt-3").is_err());
    }

    #[test]
    fn test_gemini_provider_api_key() {
        let original = env::var("GEMINI_API_KEY").ok();

        unsafe { env::remove_var("GEMINI_API_KEY"); }
        let missing = GeminiProvider::new("gemini-2.5-flash".to_string());

        unsafe { env::set_var("GEMINI_API_KEY", "test-key"); }
        let present = GeminiProvider::new("gemini-2.5-flash".to_string());

        unsafe { env::remove_var("GEMINI_API_KEY"); }
        if let Some(val) = original {
            unsafe { env::set_var("GEMINI_API_KEY", val); }
        }

        assert!(missing.unwrap_err().to_string().contains("GEMINI_API_KEY"));
        assert_eq!(present.unwrap().model_name(), "gemini-2.5-flash");
    }

    #[test]
    fn test_gemini_request_body() {
        let body = GeminiProvider::request_body(&CompletionRequest {
            system: Some("be brief".to_string()),
            prompt: "hello".to_string(),
            schema: Some(email_draft_schema()),
            temperature: Some(0.7),
            web_search: true,
        });
        assert_eq!(body["contents"][0]["parts"][0]["text"], json!("hello"));
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], json!("be brief"));
        assert_eq!(body["generationConfig"]["responseMimeType"], json!("application/json"));
        assert_eq!(body["generationConfig"]["responseSchema"]["required"], json!(["subject", "body"]));
        assert_eq!(body["tools"], json!([{ "google_search": {} }]));

        let plain = GeminiProvider::request_body(&CompletionRequest {
            prompt: "hi".to_string(),
            ..Default::default()
        });
        assert!(plain.get("generationConfig").is_none());
        assert!(plain.get("tools").is_none());
        assert!(plain.get("systemInstruction").is_none());
    }

    #[test]
    fn test_gemini_response_collects_text_and_unique_sources() {
        let response: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": { "parts": [{ "text": "EMAIL: a@b.com\n" }, { "text": "NAME: Jo" }] },
                "groundingMetadata": { "groundingChunks": [
                    { "web": { "uri": "https://a.example" } },
                    { "web": { "uri": "https://b.example" } },
                    { "web": { "uri": "https://a.example" } },
                    { "retrievedContext": {} }
                ]}
            }]
        }))
        .unwrap();
        let completion = response.into_completion();
        assert_eq!(completion.text, "EMAIL: a@b.com\nNAME: Jo");
        assert_eq!(completion.sources, vec!["https://a.example", "https://b.example"]);

        let empty: GeminiResponse = serde_json::from_value(json!({})).unwrap();
        assert_eq!(empty.into_completion(), Completion::default());
    }

    #[test]
    fn test_clean_and_parse_json() {
        let fenced = "Here you go:\n```json\n{\"summary\": \"ok\"}\n```";
        assert_eq!(clean_and_parse_json(fenced), Some(json!({ "summary": "ok" })));
        assert_eq!(clean_and_parse_json("no json here"), None);
        assert_eq!(clean_and_parse_json(""), None);
    }

    #[test]
    fn test_analyze_job_truncates_description() {
        let stub = StubProvider::new(
            r#"{"score": 7.5, "recommendation": "CONTACT", "reasoning": "good fit",
                "painPoints": ["scaling"], "matchingSkills": ["Rust"]}"#,
            &[],
        );
        let analysis = analyze_job(&stub, &job(), &profile()).unwrap();
        assert_eq!(analysis.score, 7.5);
        assert_eq!(analysis.recommendation, "CONTACT");
        assert_eq!(analysis.matching_skills, vec!["Rust".to_string()]);

        let request = stub.last_request();
        assert!(request.schema.is_some());
        assert!(request.system.unwrap().contains("Ferrous Works"));
        assert!(request.prompt.contains(&"x".repeat(1500)));
        assert!(!request.prompt.contains(&"x".repeat(1501)));
    }

    #[test]
    fn test_analyze_job_rejects_garbage() {
        let stub = StubProvider::new("I cannot help with that", &[]);
        assert!(analyze_job(&stub, &job(), &profile()).is_err());
    }

    #[test]
    fn test_generate_email_uses_services_without_analysis() {
        let stub = StubProvider::new(r#"{"subject": "re: backend engineer", "body": "Hi"}"#, &[]);
        let draft = generate_email(&stub, &job(), &profile()).unwrap();
        assert_eq!(draft.subject, "re: backend engineer");

        let request = stub.last_request();
        assert_eq!(request.temperature, Some(0.7));
        assert!(request.prompt.contains("MATCHING SKILLS: Rust, Postgres, Kubernetes\n"));
        assert!(request.prompt.contains("COMPANY: Acme"));
        assert!(!request.prompt.contains(&"x".repeat(501)));
    }

    #[test]
    fn test_find_email_parses_labels() {
        let stub = StubProvider::new(
            "Sure.\nEMAIL: jane@acme.com\nNAME: Jane Doe, CTO\n",
            &["https://acme.com/team"],
        );
        let found = find_email(&stub, &job()).unwrap();
        assert_eq!(found.email.as_deref(), Some("jane@acme.com"));
        assert_eq!(found.name.as_deref(), Some("Jane Doe, CTO"));
        assert_eq!(found.sources, vec!["https://acme.com/team".to_string()]);
        assert!(stub.last_request().web_search);
    }

    #[test]
    fn test_find_email_drops_non_addresses() {
        let stub = StubProvider::new("email: Not found\nname: unknown", &[]);
        let found = find_email(&stub, &job()).unwrap();
        assert!(found.email.is_none());
        assert_eq!(found.name.as_deref(), Some("unknown"));

        let stub = StubProvider::new("EMAIL: N/A", &[]);
        assert!(find_email(&stub, &job()).unwrap().email.is_none());

        let stub = StubProvider::new("nothing useful", &[]);
        assert_eq!(find_email(&stub, &job()).unwrap(), EmailLookup::default());
    }

    #[test]
    fn test_label_patterns_are_reused_across_calls() {
        assert!(EMAIL_LINE.is_some());
        assert!(NAME_LINE.is_some());

        let reply = "name:   Sam Lee  \nEmail:\tsam@initech.com trailing";
        for _ in 0..2 {
            assert_eq!(labelled_value(reply, &EMAIL_LINE).as_deref(), Some("sam@initech.com"));
            assert_eq!(labelled_value(reply, &NAME_LINE).as_deref(), Some("Sam Lee"));
        }
        assert!(labelled_value("NAME:   \n", &NAME_LINE).is_none());
    }

    #[test]
    fn test_analyze_company_attaches_sources() {
        let stub = StubProvider::new(
            "```json\n{\"summary\": \"Widgets\", \"painPoints\": [\"legacy\"]}\n```",
            &["https://acme.com"],
        );
        let analysis = analyze_company(&stub, &company(), &profile()).unwrap().unwrap();
        assert_eq!(analysis["summary"], json!("Widgets"));
        assert_eq!(analysis["sources"], json!(["https://acme.com"]));

        let stub = StubProvider::new("sorry", &["https://acme.com"]);
        assert!(analyze_company(&stub, &company(), &profile()).unwrap().is_none());
    }

    #[test]
    fn test_find_decision_maker_defaults() {
        let stub = StubProvider::new(
            r#"{"contacts": [{"name": "Jo", "role": "CTO", "email": "", "linkedin": ""}], "generalEmail": "hi@acme.com"}"#,
            &["https://linkedin.com/in/jo"],
        );
        let found = find_decision_maker(&stub, &company()).unwrap();
        assert_eq!(found["generalEmail"], json!("hi@acme.com"));
        assert_eq!(found["decisionMakerSources"], json!(["https://linkedin.com/in/jo"]));

        let stub = StubProvider::new("no idea", &[]);
        let found = find_decision_maker(&stub, &company()).unwrap();
        assert_eq!(found, json!({ "contacts": [], "generalEmail": "" }));
    }

    #[test]
    fn test_generate_company_email_recipient() {
        let stub = StubProvider::new(r#"{"subject": "question", "body": "Hi Jo,"}"#, &[]);
        generate_company_email(&stub, &company(), &profile(), Some("Jo"), Some("CTO")).unwrap();
        let request = stub.last_request();
        assert!(request.prompt.contains("RECIPIENT: Jo (CTO)"));
        assert!(request.prompt.contains("COMPANY SUMMARY: Unknown"));
        assert!(request.system.unwrap().contains("Hi Jo,"));

        generate_company_email(&stub, &company(), &profile(), None, None).unwrap();
        let request = stub.last_request();
        assert!(request.prompt.contains("RECIPIENT: Team"));
        assert!(request.prompt.contains("Consultative problem solving"));
    }
}
