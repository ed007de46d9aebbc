//! Display labels for raw status codes.

use crate::types::Collection;

const CLIENT_STATUS: &[(&str, &str)] = &[
    ("pending", "Pendente"),
    ("approved", "Aprovado"),
    ("rejected", "Rejeitado"),
    ("active", "Ativo"),
    ("inactive", "Inativo"),
];

const PROPOSAL_STATUS: &[(&str, &str)] = &[
    ("pending", "Pendente"),
    ("in_analysis", "Em Análise"),
    ("with_pendencies", "Com Pendências"),
    ("approved", "Aprovada"),
    ("rejected", "Rejeitada"),
    ("canceled", "Cancelada"),
];

const PIPELINE_STATUS: &[(&str, &str)] = &[
    ("submitted", "Cadastro Enviado"),
    ("pre_analysis", "Pré-Análise"),
    ("credit", "Análise de Crédito"),
    ("legal", "Jurídico"),
    ("contract", "Contrato"),
    ("closed", "Negócio Fechado"),
    ("lost", "Perdido"),
];

fn lookup(table: &[(&str, &'static str)], code: Option<&str>) -> String {
    match code {
        None => String::new(),
        Some(code) => table
            .iter()
            .find(|(k, _)| *k == code)
            .map(|(_, label)| (*label).to_string())
            .unwrap_or_else(|| code.to_string()),
    }
}

/// Unknown codes pass through unchanged; a missing code becomes "".
pub fn status_label(collection: Collection, code: Option<&str>) -> String {
    match collection {
        Collection::Clients => lookup(CLIENT_STATUS, code),
        Collection::Proposals => lookup(PROPOSAL_STATUS, code),
    }
}

pub fn pipeline_label(code: Option<&str>) -> String {
    lookup(PIPELINE_STATUS, code)
}
