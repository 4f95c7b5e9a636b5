//! Boundary types: the envelope, its JSON-lines codec, and the in-memory link
//! that carries envelopes between a controller and one UI context.

#[cfg(feature = "stream")]
pub mod codec;
pub mod envelope;

use tokio::sync::mpsc;

use envelope::Envelope;

/// One side of a duplex envelope pipe.
///
/// `tx` carries outgoing envelopes, `rx` yields incoming ones. Dropping `tx`
/// signals teardown to the peer.
#[derive(Debug)]
pub struct Link {
    pub tx: mpsc::UnboundedSender<Envelope>,
    pub rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Link {
    /// Two connected in-process endpoints: `(controller_side, ui_side)`.
    pub fn pair() -> (Link, Link) {
        let (to_ui_tx, to_ui_rx) = mpsc::unbounded_channel();
        let (to_controller_tx, to_controller_rx) = mpsc::unbounded_channel();
        (
            Link {
                tx: to_ui_tx,
                rx: to_controller_rx,
            },
            Link {
                tx: to_controller_tx,
                rx: to_ui_rx,
            },
        )
    }
}
