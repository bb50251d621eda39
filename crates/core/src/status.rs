use serde::Serialize;

/// Coarse classification of a carrier-reported delivery status.
///
/// The carrier reports free-text labels; the service stores them verbatim and
/// only uses the stage to detect out-of-order updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStage {
    Created,
    Preparing,
    PickedUp,
    InTransit,
    AtDestination,
    OutForDelivery,
    AttemptFailed,
    DeliveryFailed,
    Returning,
    Delivered,
    Returned,
    OnHold,
    Unknown,
}

impl DeliveryStage {
    /// Maps a Yalidine status label onto a stage. Matching ignores case and
    /// surrounding whitespace.
    pub fn classify(status: &str) -> Self {
        let normalized = status.trim().to_lowercase();
        match normalized.as_str() {
            "pas encore expédié" | "a vérifier" | "à vérifier" => Self::Created,
            "en préparation" | "pas encore ramassé" | "prêt à expédier" => Self::Preparing,
            "ramassé" => Self::PickedUp,
            "transfert" | "expédié" | "centre" | "vers wilaya" | "reçu à wilaya"
            | "en localisation" => Self::InTransit,
            "en attente du client" | "prêt pour livreur" | "en attente" => Self::AtDestination,
            "sorti en livraison" => Self::OutForDelivery,
            "tentative échouée" | "en alerte" => Self::AttemptFailed,
            "echèc livraison" | "echec livraison" | "échec livraison" | "echange échoué" => {
                Self::DeliveryFailed
            }
            "retour vers centre" | "retourné au centre" | "retour transfert" | "retour groupé"
            | "retour à retirer" | "retour vers vendeur" => Self::Returning,
            "livré" => Self::Delivered,
            "retourné au vendeur" => Self::Returned,
            "bloqué" | "débloqué" => Self::OnHold,
            _ => Self::Unknown,
        }
    }

    /// Position in the shipment lifecycle. Holds and unrecognised labels can
    /// occur at any point and have no rank.
    pub fn rank(self) -> Option<u8> {
        match self {
            Self::Created => Some(0),
            Self::Preparing => Some(1),
            Self::PickedUp => Some(2),
            Self::InTransit => Some(3),
            Self::AtDestination => Some(4),
            // Delivery attempts alternate with failed attempts.
            Self::OutForDelivery | Self::AttemptFailed => Some(5),
            Self::DeliveryFailed | Self::Returning => Some(6),
            Self::Delivered | Self::Returned => Some(7),
            Self::OnHold | Self::Unknown => None,
        }
    }

    /// Returns `true` for states after which no carrier update is expected.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Returned)
    }
}

/// Returns `true` when moving from `previous` to `next` goes backwards in the
/// lifecycle. Unranked statuses never count as a regression.
pub fn is_regression(previous: &str, next: &str) -> bool {
    let previous = DeliveryStage::classify(previous);
    let next = DeliveryStage::classify(next);
    match (previous.rank(), next.rank()) {
        (Some(from), Some(to)) => to < from || (previous.is_terminal() && previous != next),
        _ => false,
    }
}
