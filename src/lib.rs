pub mod crypto;
pub mod net;

pub use crypto::{verify, CryptoError, DilithiumVerifier, Keypair};
pub use net::{
    Clock, Config, Core, CoreError, FakeClock, HandlerCapability, HelloMessage, Message,
    MockTransport, PeerId, SchedulerConfig, SendResult, SignatureVerifier, Signer, SystemClock,
    Transport,
};
