/**
 * FRAME EXTRACTOR - Extraction d'une trame JSON depuis un chunk brut
 *
 * RÔLE :
 * Les interphones émettent des trames JSON noyées dans du bruit (préambules
 * binaires, retours chariot, bannières). Ce module isole la première trame
 * exploitable d'un chunk reçu sur la socket.
 *
 * FONCTIONNEMENT :
 * - Décodage UTF-8 tolérant + trim des blancs
 * - Span de la PREMIÈRE '{' à la DERNIÈRE '}' (pas de parse équilibré)
 * - Décodage JSON du span
 *
 * LIMITE ASSUMÉE : une trame coupée entre deux chunks, ou plusieurs trames
 * concaténées dans un même chunk, ne donnent que le premier span par chunk.
 * Comportement voulu, les appareils ré-émettent.
 */

use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("no frame present in chunk")]
    NoFrame,
    #[error("frame decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Extrait la première trame JSON d'un chunk brut.
/// Erreur locale dans tous les cas : la trame est jetée, la connexion vit.
pub fn extract_frame(chunk: &[u8]) -> Result<Value, FrameError> {
    let text = String::from_utf8_lossy(chunk);
    let trimmed = text.trim();

    let start = trimmed.find('{').ok_or(FrameError::NoFrame)?;
    let end = trimmed.rfind('}').ok_or(FrameError::NoFrame)?;
    if end < start {
        // '}' avant '{' : pas de span exploitable
        return Err(FrameError::NoFrame);
    }

    let span = &trimmed[start..=end];
    Ok(serde_json::from_str(span)?)
}
