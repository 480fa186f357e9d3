pub mod helpers;
mod tests_dict;
