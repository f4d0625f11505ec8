//! Coupon reservations awaiting asynchronous confirmation.

pub mod model;
pub mod status;

pub use model::CouponReservation;
pub use status::ReservationStatus;
