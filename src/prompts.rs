//! Prompt and e-mail templates.
//!
//! All user-facing Portuguese text lives here so wording changes happen in
//! one place and tests can inspect the templates without a model or a relay.

/// System message for the summarization call.
pub const SUMMARY_SYSTEM_PROMPT: &str = "Você é um assistente jurídico. Responda apenas com o resumo, \
em português brasileiro, sem títulos, listas, Markdown ou comentários.";

/// Build the user message asking for a summary of at most `max_chars` characters.
pub fn summary_prompt(text: &str, max_chars: usize) -> String {
    format!(
        "Por favor, resuma o seguinte documento jurídico em português brasileiro.\n\
         O resumo deve ser conciso (máximo {max_chars} caracteres) e destacar os pontos principais:\n\n\
         {text}\n\n\
         Resumo:"
    )
}

/// Subject line for the delivery e-mail.
pub fn email_subject(stem: &str) -> String {
    format!("Documento Processado - {stem}")
}

/// Plain-text body for the delivery e-mail.
pub fn email_body(summary: Option<&str>) -> String {
    let summary = summary.unwrap_or("(resumo indisponível)");
    format!(
        "Olá,\n\n\
         Seu documento foi processado com sucesso.\n\n\
         Resumo:\n{summary}\n\n\
         O documento completo com QR code está anexado.\n\n\
         Atenciosamente,\n\
         Sistema de Automação de Documentos\n"
    )
}
